//! Broker/CLI configuration file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk configuration, `/etc/linuxio/config.toml` by default with a
/// per-user fallback under the XDG config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Auth broker socket path.
    pub socket: PathBuf,
    /// Bridge binary the broker execs per session.
    pub bridge_binary: PathBuf,
    /// Runtime directory for per-session bridge sockets.
    pub runtime_dir: PathBuf,
    /// Group whose members get privileged sessions.
    pub admin_group: Option<String>,
    /// Message-of-the-day file.
    pub motd: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(linuxio_auth::DEFAULT_AUTH_SOCKET),
            bridge_binary: PathBuf::from("/usr/libexec/linuxio-bridge"),
            runtime_dir: PathBuf::from("/run/linuxio"),
            admin_group: Some("wheel".to_string()),
            motd: PathBuf::from("/etc/motd"),
        }
    }
}

impl Config {
    /// System-wide configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/linuxio/config.toml")
    }

    /// Per-user fallback path.
    #[must_use]
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("linuxio").join("config.toml"))
    }

    /// Load from an explicit path.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or not valid TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("cannot read {}: {err}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|err| anyhow::anyhow!("cannot parse {}: {err}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the first existing config file, or defaults.
    ///
    /// # Errors
    ///
    /// Fails when an existing file is malformed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let candidates = [Some(Self::default_path()), Self::user_path()];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Reject obviously broken configurations early.
    ///
    /// # Errors
    ///
    /// Fails on empty paths.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.socket.as_os_str().is_empty() {
            anyhow::bail!("broker socket path is empty");
        }
        if self.bridge_binary.as_os_str().is_empty() {
            anyhow::bail!("bridge binary path is empty");
        }
        if self.runtime_dir.as_os_str().is_empty() {
            anyhow::bail!("runtime directory is empty");
        }
        Ok(())
    }
}
