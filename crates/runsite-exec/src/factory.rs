//! Executor construction from a target description

use std::sync::Arc;

use tracing::debug;

use crate::docker::ContainerExecutor;
use crate::error::ExecError;
use crate::local::LocalExecutor;
use crate::ssh::SshExecutor;
use crate::target::{Endpoint, ExecutionTarget};
use crate::traits::Executor;

/// Create the engine for `target`, starting in its working directory
///
/// # Errors
/// `ExecError::SshKeyError` if an SSH key cannot be loaded,
/// `ExecError::BackendUnavailable` if the Docker client cannot be set up
pub fn executor_for(target: &ExecutionTarget) -> Result<Arc<dyn Executor>, ExecError> {
    let executor: Arc<dyn Executor> = match &target.endpoint {
        Endpoint::Local => Arc::new(LocalExecutor::new()),
        Endpoint::Ssh(endpoint) => Arc::new(SshExecutor::new(endpoint.clone())?),
        Endpoint::Container { container_id } => Arc::new(ContainerExecutor::connect(container_id)?),
    };
    executor.set_cwd(&target.working_dir);

    debug!(
        protocol = %target.protocol(),
        executor = executor.executor_type(),
        cwd = %executor.cwd(),
        "created executor"
    );
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::keys::KeySource;
    use crate::target::SshEndpoint;

    #[test]
    fn test_local_target() {
        let target = ExecutionTarget::local().with_working_dir("/tmp");

        let executor = executor_for(&target).unwrap();

        assert_eq!(executor.executor_type(), "local");
        assert_eq!(executor.cwd(), "/tmp");
    }

    #[test]
    fn test_ssh_target_with_missing_key() {
        let endpoint = SshEndpoint::new(
            "example.invalid",
            "deploy",
            KeySource::Path(PathBuf::from("/nonexistent/runsite/id_ed25519")),
        );

        let result = executor_for(&ExecutionTarget::ssh(endpoint));

        assert!(matches!(result, Err(ExecError::SshKeyError(_))));
    }
}
