//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where the private key for an SSH target comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Explicit path to key file (`~/` is expanded)
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Resolve key source to a readable key file
    ///
    /// For `Env`, decodes base64 and writes to a temp file
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                let path = expand_home(path);
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(&path)?;
                Ok(ResolvedKey::Path(path))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;

                let temp_path = write_temp_key(&key_data)?;
                Ok(ResolvedKey::Temp(temp_path))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Temporary file (will be deleted on drop)
    Temp(PathBuf),
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ResolvedKey::Path(p) | ResolvedKey::Temp(p) => p,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, KeyError> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let temp_path = env::temp_dir().join(format!("runsite_ssh_key_{}", uuid::Uuid::new_v4()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&temp_path)?;
    file.write_all(key_data)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}

impl Drop for ResolvedKey {
    fn drop(&mut self) {
        if let ResolvedKey::Temp(path) = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                warn!(path = %path.display(), error = %e, "failed to remove temp key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_file() {
        let source = KeySource::Path(PathBuf::from("/nonexistent/runsite/id_rsa"));

        assert!(matches!(source.resolve(), Err(KeyError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_open_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let source = KeySource::Path(path);
        assert!(matches!(source.resolve(), Err(KeyError::BadPermissions(_))));
    }

    #[test]
    fn test_env_key_written_and_removed() {
        let var = format!("RUNSITE_TEST_KEY_{}", std::process::id());
        // SAFETY: the variable name is unique to this test
        unsafe { env::set_var(&var, "a2V5LWRhdGE=") };

        let resolved = KeySource::Env(var.clone()).resolve().unwrap();
        let path = resolved.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"key-data");

        drop(resolved);
        assert!(!path.exists());
        unsafe { env::remove_var(&var) };
    }

    #[test]
    fn test_env_key_not_set() {
        let source = KeySource::Env("RUNSITE_TEST_KEY_DOES_NOT_EXIST".to_string());

        assert!(matches!(source.resolve(), Err(KeyError::EnvNotSet(_))));
    }

    #[test]
    fn test_env_key_invalid_base64() {
        let var = format!("RUNSITE_TEST_BAD_KEY_{}", std::process::id());
        unsafe { env::set_var(&var, "!!not base64!!") };

        let result = KeySource::Env(var.clone()).resolve();
        assert!(matches!(result, Err(KeyError::InvalidBase64)));
        unsafe { env::remove_var(&var) };
    }
}
