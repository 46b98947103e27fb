//! runsite-exec: run a command somewhere
//!
//! One [`Executor`] contract with three engines: the local machine, a remote
//! host over SSH and a running Docker container. Engines report exit codes,
//! stream output to progress callbacks, spawn detached processes and keep
//! persistent tmux sessions.

pub mod docker;
pub mod error;
pub mod factory;
pub mod keys;
pub mod local;
pub mod options;
pub mod result;
pub mod retry;
pub mod sentinel;
pub mod session;
pub mod ssh;
pub mod target;
pub mod traits;

pub use docker::{ContainerExecutor, ContainerRuntime, DockerRuntime};
pub use error::ExecError;
pub use factory::executor_for;
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalExecutor;
pub use options::{DEFAULT_TIMEOUT, ExecOptions, OutputChunk, OutputStream, ProgressCallback};
pub use result::{CommandResult, ProcessHandle, SpawnResult, TargetState};
pub use retry::{ConnectionAttempt, RetryPolicy};
pub use session::{DEFAULT_IDLE_TIMEOUT, default_session_id};
pub use ssh::{RusshTransport, SshExecutor, SshTransport};
pub use target::{Endpoint, ExecutionTarget, Protocol, SshEndpoint};
pub use traits::Executor;
