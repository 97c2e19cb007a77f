//! Multi-remote session polling.
//!
//! Fans out one task per configured remote, funnels results through a
//! channel sized to the remote count, and drains it once every task has
//! reported. A failing remote contributes zero sessions and a log line; it
//! never aborts or delays the others.

use crate::remote::config::RemoteConfig;
use crate::remote::pool::ConnectionPool;
use crate::remote::protocol;
use crate::session::SessionInfo;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fetch session records from every configured remote concurrently. Each
/// record comes back tagged with its remote's name.
pub async fn poll_remote_sessions(
    pool: &Arc<ConnectionPool>,
    remotes: &[RemoteConfig],
) -> Vec<SessionInfo> {
    if remotes.is_empty() {
        return Vec::new();
    }

    let (tx, mut rx) = mpsc::channel::<Vec<SessionInfo>>(remotes.len());

    for remote in remotes {
        let pool = Arc::clone(pool);
        let remote = remote.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let command = protocol::list_sessions_command(remote.session_dir());
            let sessions = match pool.execute(&remote.name, &command).await {
                Ok(output) => protocol::parse_session_list(&output, &remote.name),
                Err(e) => {
                    eprintln!("[poll] remote '{}' failed: {e:#}", remote.name);
                    Vec::new()
                }
            };
            let _ = tx.send(sessions).await;
        });
    }
    // The channel closes once every task has reported and dropped its
    // sender; then the drain below terminates.
    drop(tx);

    let mut all = Vec::new();
    while let Some(batch) = rx.recv().await {
        all.extend(batch);
    }
    all
}
