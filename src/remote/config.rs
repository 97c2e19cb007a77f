//! Remote definitions loaded from a YAML file.
//!
//! The file is a list of remotes. Loaded once at startup and immutable
//! afterwards; an invalid entry fails the whole load rather than silently
//! dropping a machine from the fleet.

use color_eyre::eyre::{Result, WrapErr, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Session-directory default on a remote, expanded relative to the remote
/// user's home by the shell that runs the commands.
pub const DEFAULT_SESSION_DIR: &str = "~/.roost/sessions";

/// One configured remote machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Display name, distinct from the hostname; used as the pool key and
    /// the tag on fetched session records.
    pub name: String,

    pub host: String,

    pub user: String,

    /// Path to the private key on this machine.
    pub key: PathBuf,

    /// Status-directory override on the remote.
    #[serde(default)]
    pub session_dir: Option<String>,

    /// Bastion to tunnel through when the host is not directly reachable
    /// ("host" or "user@host").
    #[serde(default)]
    pub jump_host: Option<String>,
}

impl RemoteConfig {
    /// Status directory on this remote, falling back to the default under
    /// the remote home.
    pub fn session_dir(&self) -> &str {
        self.session_dir.as_deref().unwrap_or(DEFAULT_SESSION_DIR)
    }

    /// `user@host` destination string.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Key path with a leading `~/` expanded against the local home.
    pub fn key_path(&self) -> PathBuf {
        expand_tilde(&self.key)
    }
}

/// Expand a leading `~/` against the current user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Load remote definitions from a YAML file. A missing file means no
/// remotes are configured; anything else invalid fails the load.
pub fn load_remotes(path: &Path) -> Result<Vec<RemoteConfig>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).wrap_err_with(|| format!("failed to read {}", path.display()));
        }
    };

    let remotes: Vec<RemoteConfig> = serde_yaml_ng::from_str(&content)
        .wrap_err_with(|| format!("failed to parse {}", path.display()))?;

    for remote in &remotes {
        if remote.name.is_empty()
            || remote.host.is_empty()
            || remote.user.is_empty()
            || remote.key.as_os_str().is_empty()
        {
            bail!(
                "remote '{}' in {} is missing one of name/host/user/key",
                remote.name,
                path.display()
            );
        }
    }

    Ok(remotes)
}

/// Default path of the remotes file on this machine.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".roost")
        .join("remotes.yaml")
}
