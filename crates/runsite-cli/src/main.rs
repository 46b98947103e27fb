//! runsite CLI
//!
//! Run a command on the local machine, a remote host over SSH or inside a
//! running container, and exit with its exit code.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use runsite_exec::{
    CommandResult, ExecOptions, Executor, OutputChunk, OutputStream, ProcessHandle,
    TargetState, default_session_id, executor_for,
};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "runsite")]
#[command(about = "Run a command locally, over SSH or in a container", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $RUNSITE_CONFIG, ./runsite.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Configured target name, `local`, `container:<id>` or `user@host[:port]`
    target: String,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,

    /// Private key for `user@host` targets
    #[arg(long)]
    key: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Fail a pipeline if any stage fails
    #[arg(long)]
    pipefail: bool,

    /// Allocate a pseudo-terminal
    #[arg(long)]
    tty: bool,

    /// Do not retry transient connection failures
    #[arg(long)]
    no_retry: bool,

    /// Report the command's pid
    #[arg(long)]
    pid: bool,

    /// Connection timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its output when it exits
    Exec(RunArgs),
    /// Run a command and print output as it arrives
    Stream(RunArgs),
    /// Start a command in the background and print its handle
    Spawn(RunArgs),
    /// Run a command in a persistent tmux session
    Session {
        #[command(flatten)]
        target: TargetArgs,

        /// Session id (default: this process id)
        #[arg(long)]
        id: Option<String>,

        /// Kill the session after this many idle seconds (0 disables)
        #[arg(long)]
        idle_secs: Option<u64>,

        /// Kill the session instead of running a command
        #[arg(long, conflicts_with = "command")]
        close: bool,

        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Check whether the target accepts commands
    Ready {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Copy a local file into the target
    Cp {
        #[command(flatten)]
        target: TargetArgs,

        /// Local source file
        src: PathBuf,

        /// Destination inside the target
        dest: String,
    },
    /// Stop a process started with `spawn`
    Kill {
        #[command(flatten)]
        target: TargetArgs,

        /// Pid printed by `spawn`
        pid: u32,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open(config: &Config, args: &TargetArgs) -> Result<Arc<dyn Executor>> {
    let mut target = config.target(&args.target, args.key.clone())?;
    if let Some(cwd) = &args.cwd {
        target.working_dir.clone_from(cwd);
    }
    Ok(executor_for(&target)?)
}

fn options(config: &Config, args: &RunArgs) -> ExecOptions {
    ExecOptions::new()
        .pipefail(args.pipefail)
        .tty(args.tty)
        .retry(config.defaults.retry && !args.no_retry)
        .get_pid(args.pid)
        .timeout_ms(args.timeout_ms.unwrap_or(config.defaults.timeout_ms))
}

fn print_result(result: &CommandResult, json: bool, streamed: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if !streamed {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }
    if let Some(pid) = result.pid {
        eprintln!("pid: {pid}");
    }
    Ok(())
}

fn print_chunk(chunk: &OutputChunk) {
    // A closed pipe only loses output
    let _ = match chunk.stream {
        OutputStream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(chunk.data.as_bytes()).and_then(|()| out.flush())
        }
        OutputStream::Stderr => std::io::stderr().write_all(chunk.data.as_bytes()),
    };
}

async fn run(cli: Cli, config: &Config) -> Result<i32> {
    let json = cli.json;

    match cli.command {
        Commands::Exec(args) => {
            let executor = open(config, &args.target)?;
            let result = executor
                .exec(&args.command.join(" "), &options(config, &args))
                .await?;
            print_result(&result, json, false)?;
            Ok(result.exit_code)
        }
        Commands::Stream(args) => {
            let executor = open(config, &args.target)?;
            let mut opts = options(config, &args);
            if !json {
                opts = opts.on_progress(print_chunk);
            }
            let result = executor.exec(&args.command.join(" "), &opts).await?;
            print_result(&result, json, !json)?;
            Ok(result.exit_code)
        }
        Commands::Spawn(args) => {
            let executor = open(config, &args.target)?;
            let spawned = executor
                .spawn(&args.command.join(" "), &options(config, &args))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&spawned)?);
            } else if let Some(handle) = &spawned.handle {
                println!("{handle}");
            } else {
                eprint!("{}", spawned.result.stderr);
            }
            Ok(spawned.result.exit_code)
        }
        Commands::Session {
            target,
            id,
            idle_secs,
            close,
            command,
        } => {
            let executor = open(config, &target)?;
            let id = id.unwrap_or_else(default_session_id);
            if close {
                executor.close_session(&id).await?;
                return Ok(0);
            }
            if command.is_empty() {
                eyre::bail!("nothing to run: pass a command or --close");
            }
            let idle = match idle_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => config.defaults.idle_timeout(),
            };
            let result = executor
                .exec_persistent(&command.join(" "), &id, idle)
                .await?;
            print_result(&result, json, false)?;
            Ok(result.exit_code)
        }
        Commands::Ready { target } => {
            let executor = open(config, &target)?;
            let state = executor.state().await;
            if json {
                println!("{}", serde_json::to_string(&state)?);
            } else {
                println!("{state}");
            }
            Ok(i32::from(state != TargetState::Ready))
        }
        Commands::Cp { target, src, dest } => {
            let executor = open(config, &target)?;
            executor.copy_file(&src, &dest).await?;
            Ok(0)
        }
        Commands::Kill { target, pid } => {
            let executor = open(config, &target)?;
            executor.tear_down(&ProcessHandle::Pid(pid)).await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let code = run(cli, &config).await?;
    std::process::exit(code);
}
