//! Remote connectivity — configuration, the connection pool, the command
//! protocol, and multi-remote polling.
//!
//! All remote interaction is opaque shell command execution over one
//! multiplexed connection per remote: the protocol layer builds command
//! strings, the pool runs them, and the same strings run through `sh -c`
//! for the local machine.

pub mod config;
pub mod poll;
pub mod pool;
pub mod protocol;

use color_eyre::eyre::{Result, WrapErr};

/// Run a protocol command string on this machine — the local equivalent of
/// `ConnectionPool::execute`. Combined stdout/stderr, like the remote path.
pub async fn run_local(command: &str) -> Result<Vec<u8>> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .wrap_err("failed to run local shell")?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok(combined)
}
