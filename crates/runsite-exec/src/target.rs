//! Execution targets: where a command runs

use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::keys::KeySource;

/// Backend protocol of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// The machine running this process
    Local,
    /// A remote host reached over SSH
    Ssh,
    /// A running Docker container
    Container,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Local => write!(f, "local"),
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Container => write!(f, "container"),
        }
    }
}

/// SSH connection identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEndpoint {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Private key used for authentication
    pub key: KeySource,
}

fn default_port() -> u16 {
    22
}

impl SshEndpoint {
    /// Create new SSH endpoint on the default port
    pub fn new(host: impl Into<String>, user: impl Into<String>, key: KeySource) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            key,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse the compact `user@host[:port]` form
    ///
    /// # Errors
    /// Returns `ExecError::Config` if the user or host part is missing or the port is not a number
    pub fn parse(user_host: &str, key: KeySource) -> Result<Self, ExecError> {
        let parts: Vec<&str> = user_host
            .split(['@', ':'])
            .filter(|p| !p.is_empty())
            .collect();

        if parts.len() < 2 || !user_host.contains('@') {
            return Err(ExecError::Config(format!(
                "couldn't parse host information '{user_host}', expected 'user@hostname:port'"
            )));
        }

        let port = match parts.get(2) {
            Some(p) => p
                .parse()
                .map_err(|_| ExecError::Config(format!("invalid port '{p}' in '{user_host}'")))?,
            None => default_port(),
        };

        Ok(Self::new(parts[1], parts[0], key).with_port(port))
    }
}

/// Backend-specific identity of a target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Endpoint {
    /// Local machine
    Local,
    /// Remote host over SSH
    Ssh(SshEndpoint),
    /// Running container
    Container {
        /// Container id or name
        container_id: String,
    },
}

/// One addressable place where commands execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTarget {
    /// Backend identity
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Initial working directory for commands
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

fn default_working_dir() -> String {
    ".".to_string()
}

impl ExecutionTarget {
    /// Target for the local machine
    #[must_use]
    pub fn local() -> Self {
        Self {
            endpoint: Endpoint::Local,
            working_dir: default_working_dir(),
        }
    }

    /// Target for a remote SSH host
    #[must_use]
    pub fn ssh(endpoint: SshEndpoint) -> Self {
        Self {
            endpoint: Endpoint::Ssh(endpoint),
            working_dir: default_working_dir(),
        }
    }

    /// Target for a running container
    pub fn container(container_id: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Container {
                container_id: container_id.into(),
            },
            working_dir: default_working_dir(),
        }
    }

    /// Set initial working directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Declared protocol of this target
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self.endpoint {
            Endpoint::Local => Protocol::Local,
            Endpoint::Ssh(_) => Protocol::Ssh,
            Endpoint::Container { .. } => Protocol::Container,
        }
    }
}

/// Mutable working directory shared by every call on one engine
#[derive(Debug)]
pub struct WorkingDir(RwLock<String>);

impl WorkingDir {
    /// Create with an initial directory
    pub fn new(dir: impl Into<String>) -> Self {
        Self(RwLock::new(dir.into()))
    }

    /// Current directory
    #[must_use]
    pub fn get(&self) -> String {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace directory for subsequent calls
    pub fn set(&self, dir: impl Into<String>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = dir.into();
    }
}
