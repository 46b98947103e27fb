//! SSH command execution using russh crate
//!
//! Every call opens its own connection, runs one channel and disconnects.
//! SSH gives no exit status for the wrapped shell text we care about in every
//! setup (pty allocation, persistent sessions), so commands go through the
//! sentinel wrapper and the status is parsed back from stdout.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::KeyboardInteractiveAuthResponse;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ExecError;
use crate::options::{ChunkDecoder, DEFAULT_TIMEOUT, ExecOptions, OutputChunk};
use crate::result::{CommandResult, ProcessHandle, SpawnResult};
use crate::retry::{ConnectionAttempt, RetryPolicy};
use crate::sentinel::{StdoutFilter, parse_output, quote_dir, shell_quote, wrap_command, wrap_spawn};
use crate::session::{ScriptRunner, SessionManager};
use crate::target::{SshEndpoint, WorkingDir};
use crate::traits::Executor;

/// One channel's worth of work
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    /// Shell text passed to `exec`
    pub command: String,
    /// Bytes written to the channel's stdin before EOF
    pub stdin: Option<Vec<u8>>,
    /// Request a pty before exec
    pub pty: bool,
    /// Bound on connect and handshake
    pub timeout: Duration,
}

impl ChannelRequest {
    fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            pty: false,
            timeout,
        }
    }
}

/// Data arriving on an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent<'a> {
    /// Bytes on stdout
    Stdout(&'a [u8]),
    /// Bytes on stderr (extended data type 1)
    Stderr(&'a [u8]),
}

/// Whether the transport keeps reading after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading until the channel closes
    Continue,
    /// Close the channel now
    Stop,
}

/// Event sink driven by a transport
pub type ChannelSink<'s> = dyn FnMut(ChannelEvent<'_>) -> Flow + Send + 's;

/// Connects, authenticates and runs a single channel
#[async_trait]
pub trait SshTransport: Send + Sync + 'static {
    /// Run `request`, feeding output to `sink`; returns the channel exit status
    ///
    /// # Errors
    /// `ExecError::ConnectionFailed` for transport failures,
    /// `ExecError::AuthenticationFailed` or `ExecError::UnexpectedPrompt` when
    /// the server does not let us in
    async fn run(
        &self,
        request: &ChannelRequest,
        sink: &mut ChannelSink<'_>,
    ) -> Result<Option<u32>, ExecError>;
}

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned (StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Production transport over `russh`
pub struct RusshTransport {
    endpoint: SshEndpoint,
    key: Arc<PrivateKey>,
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RusshTransport {
    /// Resolve and load the endpoint's private key
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be resolved or parsed
    pub fn new(endpoint: SshEndpoint) -> Result<Self, ExecError> {
        let resolved = endpoint
            .key
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        let key = load_secret_key(resolved.path(), None)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            endpoint,
            key: Arc::new(key),
        })
    }

    #[instrument(skip(self), fields(host = %self.endpoint.host))]
    async fn connect(&self, limit: Duration) -> Result<client::Handle<SshClientHandler>, ExecError> {
        debug!(
            port = self.endpoint.port,
            user = %self.endpoint.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let connecting = client::connect(
            config,
            (self.endpoint.host.as_str(), self.endpoint.port),
            SshClientHandler,
        );

        let mut session = match timeout(limit, connecting).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(ExecError::ConnectionFailed(e.to_string())),
            Err(_) => {
                return Err(ExecError::ConnectionFailed(format!(
                    "Timed out while waiting for handshake ({limit:?})"
                )));
            }
        };

        self.authenticate(&mut session).await?;
        debug!("SSH connected and authenticated");
        Ok(session)
    }

    async fn authenticate(
        &self,
        session: &mut client::Handle<SshClientHandler>,
    ) -> Result<(), ExecError> {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth = session
            .authenticate_publickey(
                &self.endpoint.user,
                PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if auth.success() {
            return Ok(());
        }

        // Find out whether the server wanted to ask something instead
        let prompt = session
            .authenticate_keyboard_interactive_start(&self.endpoint.user, None::<String>)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        match prompt {
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } if !prompts.is_empty() => {
                Err(ExecError::UnexpectedPrompt(format!(
                    "{}@{} asked {} question(s) after the key was rejected",
                    self.endpoint.user,
                    self.endpoint.host,
                    prompts.len()
                )))
            }
            _ => Err(ExecError::AuthenticationFailed(
                "Public key authentication failed".to_string(),
            )),
        }
    }

    async fn drive(
        session: &mut client::Handle<SshClientHandler>,
        request: &ChannelRequest,
        sink: &mut ChannelSink<'_>,
    ) -> Result<Option<u32>, ExecError> {
        let io = |e: russh::Error| ExecError::IoError(e.to_string());

        let mut channel = session.channel_open_session().await.map_err(io)?;
        if request.pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(io)?;
        }
        channel
            .exec(true, request.command.as_str())
            .await
            .map_err(io)?;
        if let Some(stdin) = &request.stdin {
            channel.data(stdin.as_slice()).await.map_err(io)?;
            channel.eof().await.map_err(io)?;
        }

        let mut status = None;
        while let Some(msg) = channel.wait().await {
            let flow = match msg {
                ChannelMsg::Data { data } => sink(ChannelEvent::Stdout(&data[..])),
                ChannelMsg::ExtendedData { data, ext: 1 } => sink(ChannelEvent::Stderr(&data[..])),
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(exit_status);
                    Flow::Continue
                }
                ChannelMsg::Close => break,
                _ => Flow::Continue,
            };
            if flow == Flow::Stop {
                break;
            }
        }

        Ok(status)
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn run(
        &self,
        request: &ChannelRequest,
        sink: &mut ChannelSink<'_>,
    ) -> Result<Option<u32>, ExecError> {
        let mut session = self.connect(request.timeout).await?;
        let outcome = Self::drive(&mut session, request, sink).await;

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.endpoint.host, error = %e, "disconnect failed");
        }
        outcome
    }
}

/// Transport plus retry policy; runs raw shell text on the host
#[derive(Debug)]
pub struct SshShell<T> {
    transport: T,
    retry: RetryPolicy,
    host: String,
}

impl<T: SshTransport> SshShell<T> {
    /// Run a request, reconnecting on transient failures
    async fn run(
        &self,
        request: &ChannelRequest,
        retry: bool,
        sink: &mut ChannelSink<'_>,
    ) -> Result<Option<u32>, ExecError> {
        let mut attempt = ConnectionAttempt::new();
        loop {
            match self.transport.run(request, sink).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    let Some(delay) = self.retry.next_delay(retry, &mut attempt, &e) else {
                        if attempt.number > 1 {
                            warn!(host = %self.host, attempts = attempt.number, error = %e, "giving up on connection");
                        }
                        return Err(attempt.into_error());
                    };
                    warn!(
                        host = %self.host,
                        attempt = attempt.number,
                        delay = ?delay,
                        error = %e,
                        "transient connection failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run a request and collect both streams
    async fn collect(
        &self,
        request: &ChannelRequest,
        retry: bool,
    ) -> Result<(String, String, Option<u32>), ExecError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut sink = |event: ChannelEvent<'_>| {
            match event {
                ChannelEvent::Stdout(data) => stdout.extend_from_slice(data),
                ChannelEvent::Stderr(data) => stderr.extend_from_slice(data),
            }
            Flow::Continue
        };
        let status = self.run(request, retry, &mut sink).await?;

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            status,
        ))
    }
}

#[async_trait]
impl<T: SshTransport> ScriptRunner for SshShell<T> {
    async fn run_script(&self, script: &str) -> Result<CommandResult, ExecError> {
        let request = ChannelRequest::new(script, DEFAULT_TIMEOUT);
        let (stdout, stderr, status) = self.collect(&request, true).await?;
        let status = status.ok_or_else(|| {
            ExecError::ExitStatusUndetermined("channel closed without exit status".to_string())
        })?;
        Ok(CommandResult::new(stdout, stderr, status.cast_signed()))
    }
}

/// SSH command executor
///
/// Runs commands on a remote host. The working directory is applied to every
/// command through the sentinel wrapper.
pub struct SshExecutor<T = RusshTransport> {
    shell: Arc<SshShell<T>>,
    cwd: WorkingDir,
    sessions: SessionManager,
}

impl<T> std::fmt::Debug for SshExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("host", &self.shell.host)
            .field("cwd", &self.cwd.get())
            .field("retry", &self.shell.retry)
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create an executor for `endpoint` with the default retry policy
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(endpoint: SshEndpoint) -> Result<Self, ExecError> {
        let host = endpoint.host.clone();
        let transport = RusshTransport::new(endpoint)?;
        Ok(Self::with_transport(host, transport, RetryPolicy::default()))
    }
}

impl<T: SshTransport> SshExecutor<T> {
    /// Create an executor on top of any transport
    pub fn with_transport(host: impl Into<String>, transport: T, retry: RetryPolicy) -> Self {
        Self {
            shell: Arc::new(SshShell {
                transport,
                retry,
                host: host.into(),
            }),
            cwd: WorkingDir::new("."),
            sessions: SessionManager::new(),
        }
    }

    /// Start a long-running service and wait until its output contains `wait_for`
    ///
    /// The service writes to a log file on the host which is followed until the
    /// condition matches; an empty `wait_for` resolves on the first output.
    /// The service keeps running after the channel closes.
    ///
    /// # Errors
    /// Returns connection errors
    #[instrument(skip(self, options), fields(host = %self.shell.host))]
    pub async fn setup(
        &self,
        cmd: &str,
        wait_for: &str,
        options: &ExecOptions,
    ) -> Result<SpawnResult, ExecError> {
        let log = format!("/tmp/runsite-{}.log", Uuid::new_v4().simple());
        let script = format!(
            "cd {dir} && {{ : >{log}; nohup sh -c {cmd} >>{log} 2>&1 </dev/null & echo $!; exec tail -n +1 -f {log}; }}",
            dir = quote_dir(&self.cwd.get()),
            cmd = shell_quote(cmd),
        );
        let mut request = ChannelRequest::new(script, options.timeout);
        request.pty = options.tty;

        let mut pid_line = Vec::new();
        let mut pid = None;
        let mut decoder = ChunkDecoder::default();
        let mut seen = String::new();
        let mut stderr = ChunkDecoder::default();
        let mut errors = String::new();

        let mut sink = |event: ChannelEvent<'_>| {
            let mut data = match event {
                ChannelEvent::Stderr(data) => {
                    errors.push_str(&stderr.push(data));
                    return Flow::Continue;
                }
                ChannelEvent::Stdout(data) => data,
            };
            if pid.is_none() {
                let Some(newline) = data.iter().position(|b| *b == b'\n') else {
                    pid_line.extend_from_slice(data);
                    return Flow::Continue;
                };
                pid_line.extend_from_slice(&data[..newline]);
                pid = Some(String::from_utf8_lossy(&pid_line).trim().parse::<u32>().ok());
                data = &data[newline + 1..];
            }
            let text = decoder.push(data);
            if text.is_empty() {
                return Flow::Continue;
            }
            options.emit(OutputChunk::stdout(text.as_str()));
            seen.push_str(&text);
            if seen.contains(wait_for) {
                Flow::Stop
            } else {
                Flow::Continue
            }
        };
        let status = self.shell.run(&request, options.retry, &mut sink).await?;

        let handle = pid.flatten().map(ProcessHandle::Pid);
        if let Some(code) = status {
            warn!(status = code, "setup command ended before its condition matched");
            return Ok(SpawnResult::started(
                handle,
                CommandResult::new(seen, errors, code.cast_signed()),
            ));
        }
        info!(wait_for = %wait_for, ?handle, "resolved wait_for condition");
        Ok(SpawnResult::started(handle, CommandResult::new(seen, errors, 0)))
    }
}

#[async_trait]
impl<T: SshTransport> Executor for SshExecutor<T> {
    #[instrument(skip(self, options), fields(host = %self.shell.host))]
    async fn exec(&self, cmd: &str, options: &ExecOptions) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, "executing remote command");
        let start = Instant::now();

        let script = wrap_command(cmd, &self.cwd.get(), options.pipefail, options.get_pid);
        let mut request = ChannelRequest::new(script, options.timeout);
        request.pty = options.tty;

        let mut raw = Vec::new();
        let mut filter = StdoutFilter::new(options.get_pid);
        let mut stderr_decoder = ChunkDecoder::default();
        let mut stderr = String::new();

        let mut sink = |event: ChannelEvent<'_>| {
            match event {
                ChannelEvent::Stdout(data) => {
                    raw.extend_from_slice(data);
                    if let Some(text) = filter.push(data) {
                        options.emit(OutputChunk::stdout(text).with_pid(filter.pid()));
                    }
                }
                ChannelEvent::Stderr(data) => {
                    let text = stderr_decoder.push(data);
                    if !text.is_empty() {
                        options.emit(OutputChunk::stderr(text.as_str()).with_pid(filter.pid()));
                        stderr.push_str(&text);
                    }
                }
            }
            Flow::Continue
        };
        self.shell.run(&request, options.retry, &mut sink).await?;
        stderr.push_str(&stderr_decoder.finish());

        let parsed = parse_output(&String::from_utf8_lossy(&raw), options.get_pid)?;
        let duration = start.elapsed();

        debug!(
            command = %cmd,
            status = parsed.exit_code,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult::new(parsed.stdout, stderr, parsed.exit_code)
            .with_pid(parsed.pid)
            .with_duration(duration))
    }

    #[instrument(skip(self, options), fields(host = %self.shell.host))]
    async fn spawn(&self, cmd: &str, options: &ExecOptions) -> Result<SpawnResult, ExecError> {
        let request = ChannelRequest::new(wrap_spawn(cmd, &self.cwd.get()), options.timeout);

        let mut first_line = Vec::new();
        let mut sink = |event: ChannelEvent<'_>| {
            let ChannelEvent::Stdout(data) = event else {
                return Flow::Continue;
            };
            first_line.extend_from_slice(data);
            if first_line.contains(&b'\n') {
                Flow::Stop
            } else {
                Flow::Continue
            }
        };
        self.shell.run(&request, options.retry, &mut sink).await?;

        let pid = String::from_utf8_lossy(&first_line)
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<u32>().ok());
        debug!(command = %cmd, ?pid, "spawned remote process");

        Ok(SpawnResult::started(
            pid.map(ProcessHandle::Pid),
            CommandResult::default(),
        ))
    }

    async fn exec_persistent(
        &self,
        cmd: &str,
        session_id: &str,
        idle_timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        self.sessions
            .exec(Arc::clone(&self.shell), cmd, session_id, idle_timeout)
            .await
    }

    async fn close_session(&self, session_id: &str) -> Result<(), ExecError> {
        self.sessions.close(self.shell.as_ref(), session_id).await
    }

    fn set_cwd(&self, cwd: &str) {
        self.cwd.set(cwd);
    }

    fn cwd(&self) -> String {
        self.cwd.get()
    }

    async fn ready(&self) -> bool {
        match self.exec("ls", &ExecOptions::new().retry(false)).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!(host = %self.shell.host, error = %e, "host not ready");
                false
            }
        }
    }

    #[instrument(skip(self), fields(host = %self.shell.host))]
    async fn copy_file(&self, src: &Path, dest: &str) -> Result<(), ExecError> {
        let content = tokio::fs::read(src).await?;
        let script = format!("cd {} && cat > {}", quote_dir(&self.cwd.get()), quote_dir(dest));
        let mut request = ChannelRequest::new(script, DEFAULT_TIMEOUT);
        request.stdin = Some(content);

        let (_, stderr, status) = self.shell.collect(&request, true).await?;
        match status {
            Some(0) => Ok(()),
            _ => Err(ExecError::IoError(format!(
                "copy to {dest} failed: {}",
                stderr.trim()
            ))),
        }
    }

    async fn tear_down(&self, handle: &ProcessHandle) -> Result<(), ExecError> {
        let ProcessHandle::Pid(pid) = handle else {
            warn!(%handle, "cannot tear down a non-pid handle over SSH");
            return Ok(());
        };

        info!(host = %self.shell.host, pid, "tearing down");
        let result = self.shell.run_script(&format!("kill {pid}")).await?;
        if !result.success() {
            warn!(pid, stderr = %result.stderr.trim(), "kill failed");
        }
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::process::Stdio;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::Command;

    use super::*;
    use crate::options::OutputStream;

    /// Runs channel requests through the local `sh`, after failing on demand
    #[derive(Default)]
    struct LocalShellTransport {
        failures: Mutex<VecDeque<ExecError>>,
        calls: AtomicU32,
        commands: Mutex<Vec<String>>,
    }

    impl LocalShellTransport {
        fn failing(failures: impl IntoIterator<Item = ExecError>) -> Self {
            Self {
                failures: Mutex::new(failures.into_iter().collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SshTransport for Arc<LocalShellTransport> {
        async fn run(
            &self,
            request: &ChannelRequest,
            sink: &mut ChannelSink<'_>,
        ) -> Result<Option<u32>, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(request.command.clone());
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }

            let mut child = Command::new("sh")
                .arg("-c")
                .arg(&request.command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let mut stdin = child.stdin.take().unwrap();
            if let Some(data) = &request.stdin {
                stdin.write_all(data).await?;
            }
            drop(stdin);

            let mut stdout = child.stdout.take().unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if sink(ChannelEvent::Stdout(&buf[..n])) == Flow::Stop {
                    child.start_kill()?;
                    return Ok(None);
                }
            }
            let mut err = Vec::new();
            child.stderr.take().unwrap().read_to_end(&mut err).await?;
            if !err.is_empty() {
                sink(ChannelEvent::Stderr(&err));
            }

            let status = child.wait().await?;
            Ok(status.code().map(i32::cast_unsigned))
        }
    }

    fn refused() -> ExecError {
        ExecError::ConnectionFailed("Connection refused (os error 111)".to_string())
    }

    fn executor(
        transport: &Arc<LocalShellTransport>,
        max_attempts: u32,
    ) -> SshExecutor<Arc<LocalShellTransport>> {
        let policy = RetryPolicy::new(Duration::from_millis(1), max_attempts);
        SshExecutor::with_transport("test-host", Arc::clone(transport), policy)
    }

    #[tokio::test]
    async fn test_exec_recovers_exit_code() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        for code in [0, 1, 2, 127] {
            let result = executor
                .exec(&format!("exit {code}"), &ExecOptions::default())
                .await
                .unwrap();
            assert_eq!(result.exit_code, code);
            assert_eq!(result.stdout, "");
        }
    }

    #[tokio::test]
    async fn test_exec_keeps_output_without_newline() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        let result = executor
            .exec("printf helloworld", &ExecOptions::default())
            .await
            .unwrap();

        assert_eq!(result.stdout, "helloworld");
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_exec_exit_does_not_skip_sentinel() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        let result = executor
            .exec("echo before; exit 3", &ExecOptions::default())
            .await
            .unwrap();

        assert_eq!(result.stdout, "before");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_exec_uses_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);
        executor.set_cwd(dir.path().to_str().unwrap());

        let result = executor
            .exec("touch helloworld && ls helloworld", &ExecOptions::default())
            .await
            .unwrap();

        assert_eq!(result.stdout, "helloworld");
        assert!(dir.path().join("helloworld").exists());
        assert_eq!(executor.cwd(), dir.path().to_str().unwrap());
    }

    #[tokio::test]
    async fn test_exec_pipefail() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        let result = executor
            .exec("false | cat", &ExecOptions::new().pipefail(true))
            .await;

        // dash has no pipefail, bash does
        if let Ok(result) = result {
            let commands = transport.commands.lock().unwrap();
            assert!(commands[0].contains("set -o pipefail\n"));
            assert!(result.exit_code == 1 || !result.stderr.is_empty());
        }
    }

    #[tokio::test]
    async fn test_exec_captures_pid() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);
        let chunks = Arc::new(Mutex::new(Vec::<OutputChunk>::new()));
        let sink = Arc::clone(&chunks);
        let options = ExecOptions::new()
            .get_pid(true)
            .on_progress(move |c| sink.lock().unwrap().push(c.clone()));

        let result = executor.exec("echo hi", &options).await.unwrap();

        assert_eq!(result.stdout, "hi");
        let pid = result.pid.expect("pid");
        assert!(pid > 0);
        let chunks = chunks.lock().unwrap();
        assert!(chunks.iter().all(|c| c.pid == Some(pid)));
    }

    #[tokio::test]
    async fn test_stream_concatenates_to_stdout() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);
        let chunks = Arc::new(Mutex::new(Vec::<OutputChunk>::new()));
        let sink = Arc::clone(&chunks);

        let result = executor
            .stream(
                "for i in 1 2 3 4 5 6 7 8 9 10; do echo line-$i; done; printf tail; echo oops >&2",
                Arc::new(move |c: &OutputChunk| sink.lock().unwrap().push(c.clone())),
                &ExecOptions::default(),
            )
            .await
            .unwrap();

        let chunks = chunks.lock().unwrap();
        let stdout: String = chunks
            .iter()
            .filter(|c| c.stream == OutputStream::Stdout)
            .map(|c| c.data.as_str())
            .collect();
        assert_eq!(stdout, result.stdout);
        assert!(result.stdout.ends_with("line-10\ntail"));
        assert_eq!(result.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let transport = Arc::new(LocalShellTransport::failing([refused(), refused()]));
        let executor = executor(&transport, 30);

        let result = executor
            .exec("echo up", &ExecOptions::default())
            .await
            .unwrap();

        assert_eq!(result.stdout, "up");
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let transport = Arc::new(LocalShellTransport::failing(
            std::iter::repeat_with(refused).take(10),
        ));
        let executor = executor(&transport, 3);

        let result = executor.exec("true", &ExecOptions::default()).await;

        assert!(matches!(result, Err(ExecError::ConnectionFailed(_))));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_gives_up_with_last_error() {
        let transport = Arc::new(LocalShellTransport::failing(
            std::iter::repeat_with(refused).take(40),
        ));
        let executor = SshExecutor::with_transport(
            "test-host",
            Arc::clone(&transport),
            RetryPolicy::default(),
        );
        let start = tokio::time::Instant::now();

        let result = executor.exec("true", &ExecOptions::default()).await;

        assert!(matches!(
            &result,
            Err(ExecError::ConnectionFailed(msg))
                if msg.contains("Connection refused") && msg.ends_with("(gave up after 30 attempts)")
        ));
        assert_eq!(transport.calls(), 30);
        assert!(start.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let transport = Arc::new(LocalShellTransport::failing([refused()]));
        let executor = executor(&transport, 30);

        let result = executor
            .exec("true", &ExecOptions::new().retry(false))
            .await;

        assert!(matches!(result, Err(ExecError::ConnectionFailed(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let transport = Arc::new(LocalShellTransport::failing([
            ExecError::UnexpectedPrompt("Password:".to_string()),
        ]));
        let executor = executor(&transport, 30);

        let result = executor.exec("true", &ExecOptions::default()).await;

        assert!(matches!(result, Err(ExecError::UnexpectedPrompt(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_sentinel_is_an_error() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        // Kills the wrapping shell before the sentinel runs
        let result = executor
            .exec("kill -9 $$", &ExecOptions::default())
            .await;

        assert!(matches!(result, Err(ExecError::ExitStatusUndetermined(_))));
    }

    #[tokio::test]
    async fn test_spawn_returns_pid_without_waiting() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);
        let start = Instant::now();

        let spawned = executor
            .spawn("sleep 5", &ExecOptions::default())
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        let handle = spawned.handle.expect("pid");
        assert!(handle.pid().is_some());
        executor.tear_down(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_resolves_on_condition() {
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);

        let spawned = executor
            .setup(
                "echo booting; echo ready to serve; sleep 5",
                "ready",
                &ExecOptions::default(),
            )
            .await
            .unwrap();

        assert!(spawned.result.stdout.contains("ready to serve"));
        let handle = spawned.handle.expect("pid");
        executor.tear_down(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_false_when_unreachable() {
        let transport = Arc::new(LocalShellTransport::failing([refused()]));
        let executor = executor(&transport, 30);

        assert!(!executor.ready().await);
        assert_eq!(transport.calls(), 1);
        assert!(executor.ready().await);
    }

    #[tokio::test]
    async fn test_copy_file_writes_through_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload\nwith 'quotes'\n").unwrap();
        let transport = Arc::new(LocalShellTransport::default());
        let executor = executor(&transport, 30);
        executor.set_cwd(dir.path().to_str().unwrap());

        executor.copy_file(&src, "copied.txt").await.unwrap();

        let copied = std::fs::read_to_string(dir.path().join("copied.txt")).unwrap();
        assert_eq!(copied, "payload\nwith 'quotes'\n");
    }
}
