//! Local status-directory reading.
//!
//! Each session writes one JSON status file named after itself into a status
//! directory (default `~/.roost/sessions`). Reading is strictly best-effort:
//! a missing directory yields no sessions and malformed files are skipped,
//! never failing the batch.

use super::SessionInfo;
use std::path::{Path, PathBuf};

/// Default status directory for sessions on this machine.
pub fn default_status_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".roost")
        .join("sessions")
}

/// Read every parseable `*.json` status file in a directory.
pub fn read_status_dir(dir: &Path) -> Vec<SessionInfo> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Ok(session) = serde_json::from_str::<SessionInfo>(&content) {
            sessions.push(session);
        }
    }
    sessions
}

/// Format the age of a unix-seconds timestamp for display.
pub fn format_age(timestamp: i64) -> String {
    let secs = (chrono::Utc::now().timestamp() - timestamp).max(0);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}
