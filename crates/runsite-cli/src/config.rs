//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, bail};
use runsite_exec::{DEFAULT_IDLE_TIMEOUT, ExecutionTarget, KeySource, SshEndpoint};
use serde::{Deserialize, Serialize};

/// Top-level `runsite.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-call defaults
    #[serde(default)]
    pub defaults: Defaults,
    /// Named targets
    #[serde(default)]
    pub target: Vec<TargetConfig>,
}

/// Defaults applied to every call unless overridden on the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry transient SSH connection failures
    #[serde(default = "default_retry")]
    pub retry: bool,
    /// Idle timeout for persistent sessions, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry: default_retry(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Defaults {
    /// Session idle timeout; zero disables it
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_retry() -> bool {
    true
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

/// A named `[[target]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Name used on the command line
    pub name: String,
    /// Where commands run
    #[serde(flatten)]
    pub target: ExecutionTarget,
}

/// Key used for ad-hoc `user@host` targets when none is given
fn default_key() -> PathBuf {
    PathBuf::from("~/.ssh/id_ed25519")
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("RUNSITE_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from("runsite.toml")),
            dirs::config_dir().map(|p| p.join("runsite/runsite.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading config");
                return Self::load(&path);
            }
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Resolve a target given on the command line
    ///
    /// Accepts `local`, a configured name, `container:<id>` or `user@host[:port]`.
    ///
    /// # Errors
    /// Returns error for unknown names or malformed SSH addresses
    pub fn target(&self, name: &str, key: Option<PathBuf>) -> eyre::Result<ExecutionTarget> {
        if name == "local" {
            return Ok(ExecutionTarget::local());
        }
        if let Some(found) = self.target.iter().find(|t| t.name == name) {
            return Ok(found.target.clone());
        }
        if let Some(container) = name.strip_prefix("container:") {
            return Ok(ExecutionTarget::container(container));
        }
        if name.contains('@') {
            let key = KeySource::Path(key.unwrap_or_else(default_key));
            return Ok(ExecutionTarget::ssh(SshEndpoint::parse(name, key)?));
        }
        bail!("unknown target '{name}': not in config and not 'local', 'container:<id>' or 'user@host'")
    }
}

#[cfg(test)]
mod tests {
    use runsite_exec::{Endpoint, Protocol};

    use super::*;

    const SAMPLE: &str = r#"
[defaults]
timeout_ms = 2000

[[target]]
name = "web"
protocol = "ssh"
host = "10.0.0.5"
port = 2222
user = "deploy"
key = { path = "~/.ssh/deploy" }
working_dir = "/srv/app"

[[target]]
name = "db"
protocol = "container"
container_id = "postgres"
"#;

    #[test]
    fn test_parse_targets() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.defaults.timeout_ms, 2000);
        assert!(config.defaults.retry);
        assert_eq!(config.target.len(), 2);

        let web = config.target("web", None).unwrap();
        assert_eq!(web.protocol(), Protocol::Ssh);
        assert_eq!(web.working_dir, "/srv/app");
        let Endpoint::Ssh(endpoint) = web.endpoint else {
            panic!("expected ssh endpoint");
        };
        assert_eq!(endpoint.port, 2222);
        assert_eq!(endpoint.user, "deploy");

        let db = config.target("db", None).unwrap();
        assert_eq!(db.protocol(), Protocol::Container);
        assert_eq!(db.working_dir, ".");
    }

    #[test]
    fn test_builtin_and_adhoc_targets() {
        let config = Config::default();

        assert_eq!(config.target("local", None).unwrap().protocol(), Protocol::Local);
        assert_eq!(
            config.target("container:abc123", None).unwrap().protocol(),
            Protocol::Container
        );

        let adhoc = config.target("root@box:2200", None).unwrap();
        let Endpoint::Ssh(endpoint) = adhoc.endpoint else {
            panic!("expected ssh endpoint");
        };
        assert_eq!(endpoint.host, "box");
        assert_eq!(endpoint.port, 2200);
        assert!(matches!(endpoint.key, KeySource::Path(p) if p == default_key()));
    }

    #[test]
    fn test_unknown_target() {
        assert!(Config::default().target("nowhere", None).is_err());
    }

    #[test]
    fn test_defaults() {
        let defaults = Defaults::default();

        assert_eq!(defaults.timeout_ms, 5000);
        assert_eq!(defaults.idle_timeout(), Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(
            Defaults {
                idle_timeout_secs: 0,
                ..Defaults::default()
            }
            .idle_timeout(),
            None
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runsite.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.target[0].name, "web");
    }
}
