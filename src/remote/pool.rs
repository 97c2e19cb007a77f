//! Connection pool — at most one live authenticated connection per named
//! remote, hidden behind a single `execute(remote, command)` primitive.
//!
//! The pool caches one multiplexed connection per remote, probes it for
//! liveness before reuse, reconnects when the probe fails, and retries a
//! failed command channel exactly once. Callers never see a connection
//! handle; they only ever get command output or an error, and status
//! accessors return copies so nobody can observe a record mid-mutation.

use crate::logging::DebugLog;
use crate::remote::config::RemoteConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Dial timeout for establishing a connection, in seconds. Command
/// execution over an established connection has no matching timeout; a
/// hanging remote command blocks its caller (see DESIGN.md).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

// ── Status records ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Per-remote connection status, updated on every connect/execute attempt.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}

impl Default for RemoteStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            last_poll: None,
        }
    }
}

/// Opaque handle for an established connection. Held only by the pool.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub control_path: PathBuf,
    pub established_at: DateTime<Utc>,
}

// ── Transport seam ────────────────────────────────────────

/// How connections are dialed, probed, and driven. Production wiring uses
/// [`OpenSshTransport`]; tests inject a scripted fake. Constructor
/// injection keeps the pool logic identical in both.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Establish an authenticated connection to the remote, tunneling
    /// through its jump host when one is configured.
    async fn connect(&self, remote: &RemoteConfig) -> Result<ConnectionHandle>;

    /// Lightweight keepalive probe of an existing connection.
    async fn check(&self, remote: &RemoteConfig, handle: &ConnectionHandle) -> bool;

    /// Open a command channel and run one command, capturing combined
    /// output. An error here means the channel could not be driven, not
    /// that the remote command exited non-zero.
    async fn exec(
        &self,
        remote: &RemoteConfig,
        handle: &ConnectionHandle,
        command: &str,
    ) -> Result<Vec<u8>>;

    /// Tear down a connection. Best-effort.
    async fn close(&self, remote: &RemoteConfig, handle: &ConnectionHandle);
}

// ── Pool ──────────────────────────────────────────────────

struct PoolState {
    connections: HashMap<String, ConnectionHandle>,
    status: HashMap<String, RemoteStatus>,
}

pub struct ConnectionPool {
    remotes: HashMap<String, RemoteConfig>,
    transport: Arc<dyn SshTransport>,
    // One lock over both maps; held only for map access, never across a
    // transport await, so one slow remote cannot stall access to others.
    state: Mutex<PoolState>,
    debug: DebugLog,
}

impl ConnectionPool {
    pub fn new(
        remotes: Vec<RemoteConfig>,
        transport: Arc<dyn SshTransport>,
        debug: DebugLog,
    ) -> Self {
        let status = remotes
            .iter()
            .map(|r| (r.name.clone(), RemoteStatus::default()))
            .collect();
        let remotes = remotes.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            remotes,
            transport,
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                status,
            }),
            debug,
        }
    }

    fn config(&self, name: &str) -> Result<&RemoteConfig> {
        self.remotes
            .get(name)
            .ok_or_else(|| eyre!("unknown remote '{name}'"))
    }

    fn record(&self, name: &str, state: ConnectionState, error: Option<String>) {
        let mut guard = self.state.lock().expect("pool lock");
        let entry = guard.status.entry(name.to_string()).or_default();
        entry.state = state;
        entry.last_error = error;
        entry.last_poll = Some(Utc::now());
    }

    /// Get a live connection for the remote, reusing the cached one when
    /// its keepalive probe passes, otherwise discarding it and dialing
    /// fresh. A failure is recorded in the remote's status and returned;
    /// there is no automatic retry here.
    pub async fn connect(&self, name: &str) -> Result<ConnectionHandle> {
        let remote = self.config(name)?;

        let cached = {
            let guard = self.state.lock().expect("pool lock");
            guard.connections.get(name).cloned()
        };

        if let Some(handle) = cached {
            if self.transport.check(remote, &handle).await {
                self.debug.log("pool", format!("reusing connection to '{name}'"));
                self.record(name, ConnectionState::Connected, None);
                return Ok(handle);
            }
            self.debug
                .log("pool", format!("stale connection to '{name}', redialing"));
            self.transport.close(remote, &handle).await;
            self.state
                .lock()
                .expect("pool lock")
                .connections
                .remove(name);
        }

        match self.transport.connect(remote).await {
            Ok(handle) => {
                let mut guard = self.state.lock().expect("pool lock");
                guard.connections.insert(name.to_string(), handle.clone());
                drop(guard);
                self.record(name, ConnectionState::Connected, None);
                Ok(handle)
            }
            Err(e) => {
                self.record(name, ConnectionState::Error, Some(format!("{e:#}")));
                Err(e)
            }
        }
    }

    /// Run one command on the remote, reconnecting and retrying exactly
    /// once if the command channel cannot be opened — the usual symptom of
    /// a connection that died between the keepalive probe and now.
    pub async fn execute(&self, name: &str, command: &str) -> Result<Vec<u8>> {
        let remote = self.config(name)?;
        let handle = self.connect(name).await?;

        match self.transport.exec(remote, &handle, command).await {
            Ok(output) => {
                self.record(name, ConnectionState::Connected, None);
                Ok(output)
            }
            Err(first) => {
                self.debug.log(
                    "pool",
                    format!("channel to '{name}' failed ({first:#}), retrying once"),
                );
                self.transport.close(remote, &handle).await;
                self.state
                    .lock()
                    .expect("pool lock")
                    .connections
                    .remove(name);

                let handle = self.connect(name).await?;
                match self.transport.exec(remote, &handle, command).await {
                    Ok(output) => {
                        self.record(name, ConnectionState::Connected, None);
                        Ok(output)
                    }
                    Err(e) => {
                        self.record(name, ConnectionState::Error, Some(format!("{e:#}")));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Copy of one remote's status record.
    pub fn status(&self, name: &str) -> Option<RemoteStatus> {
        self.state
            .lock()
            .expect("pool lock")
            .status
            .get(name)
            .cloned()
    }

    /// Copies of every remote's status record.
    pub fn all_status(&self) -> HashMap<String, RemoteStatus> {
        self.state.lock().expect("pool lock").status.clone()
    }

    /// Close one remote's cached connection, if any, and reset its status.
    pub async fn disconnect(&self, name: &str) {
        let handle = {
            let mut guard = self.state.lock().expect("pool lock");
            guard.connections.remove(name)
        };
        if let Some(handle) = handle {
            if let Some(remote) = self.remotes.get(name) {
                self.transport.close(remote, &handle).await;
            }
        }
        let mut guard = self.state.lock().expect("pool lock");
        if let Some(entry) = guard.status.get_mut(name) {
            entry.state = ConnectionState::Disconnected;
            entry.last_error = None;
        }
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let names: Vec<String> = self.remotes.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }
}

// ── Production transport ──────────────────────────────────

/// Drives the system OpenSSH client with one ControlMaster connection per
/// remote: `-M -N -f` establishes the master, `-O check` probes it, plain
/// invocations over the control socket are the command channels, and
/// `-O exit` tears it down. Jump hosts map to `-J`. The private key is
/// parsed locally before any dial so a bad key fails fast with a readable
/// reason instead of an opaque auth error.
pub struct OpenSshTransport {
    control_dir: PathBuf,
    debug: DebugLog,
}

impl OpenSshTransport {
    pub fn new(debug: DebugLog) -> Self {
        Self {
            control_dir: std::env::temp_dir(),
            debug,
        }
    }

    fn control_path(&self, remote: &RemoteConfig) -> PathBuf {
        self.control_dir.join(format!("roost-{}.ctl", remote.name))
    }
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn connect(&self, remote: &RemoteConfig) -> Result<ConnectionHandle> {
        let key_path = remote.key_path();
        ssh_key::PrivateKey::read_openssh_file(&key_path).map_err(|e| {
            eyre!(
                "failed to load private key {} for remote '{}': {e}",
                key_path.display(),
                remote.name
            )
        })?;

        let control_path = self.control_path(remote);
        // A stale socket from a dead master would block the new one.
        let _ = std::fs::remove_file(&control_path);

        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-S")
            .arg(&control_path)
            .arg("-i")
            .arg(&key_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
        if let Some(jump) = &remote.jump_host {
            cmd.arg("-J").arg(jump);
        }
        cmd.arg(remote.destination());

        self.debug.log(
            "ssh",
            format!("dialing '{}' ({})", remote.name, remote.destination()),
        );
        let output = cmd
            .output()
            .await
            .wrap_err("failed to run ssh — is OpenSSH installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "connecting to '{}' failed: {}",
                remote.name,
                stderr.trim()
            );
        }

        Ok(ConnectionHandle {
            control_path,
            established_at: Utc::now(),
        })
    }

    async fn check(&self, remote: &RemoteConfig, handle: &ConnectionHandle) -> bool {
        tokio::process::Command::new("ssh")
            .arg("-S")
            .arg(&handle.control_path)
            .arg("-O")
            .arg("check")
            .arg(remote.destination())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn exec(
        &self,
        remote: &RemoteConfig,
        handle: &ConnectionHandle,
        command: &str,
    ) -> Result<Vec<u8>> {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-S")
            .arg(&handle.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(remote.destination())
            .arg(command);

        let output = cmd.output().await.wrap_err("failed to run ssh")?;

        // OpenSSH reserves exit status 255 for its own failures (dead
        // master, mux negotiation); remote command exit codes pass through
        // and their output still comes back to the caller's parsers.
        if output.status.code() == Some(255) || output.status.code().is_none() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "command channel to '{}' failed: {}",
                remote.name,
                stderr.trim()
            );
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }

    async fn close(&self, remote: &RemoteConfig, handle: &ConnectionHandle) {
        let _ = tokio::process::Command::new("ssh")
            .arg("-S")
            .arg(&handle.control_path)
            .arg("-O")
            .arg("exit")
            .arg(remote.destination())
            .output()
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted transport: fails the first `connect_failures` dials and the
    /// first `exec_failures` channel opens, counts everything.
    pub(crate) struct FakeTransport {
        pub connects: AtomicUsize,
        pub checks: AtomicUsize,
        pub execs: AtomicUsize,
        pub closes: AtomicUsize,
        pub connect_failures: AtomicUsize,
        pub exec_failures: AtomicUsize,
        pub check_ok: AtomicBool,
        /// Remote name whose dials always fail.
        pub dead_remote: Mutex<Option<String>>,
        pub output: Vec<u8>,
    }

    impl FakeTransport {
        pub(crate) fn new(output: &[u8]) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                checks: AtomicUsize::new(0),
                execs: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                connect_failures: AtomicUsize::new(0),
                exec_failures: AtomicUsize::new(0),
                check_ok: AtomicBool::new(true),
                dead_remote: Mutex::new(None),
                output: output.to_vec(),
            }
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl SshTransport for FakeTransport {
        async fn connect(&self, remote: &RemoteConfig) -> Result<ConnectionHandle> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let dead = self.dead_remote.lock().expect("dead_remote lock").clone();
            if dead.as_deref() == Some(remote.name.as_str()) {
                bail!("dial failed: host unreachable");
            }
            if Self::take_failure(&self.connect_failures) {
                bail!("dial failed");
            }
            Ok(ConnectionHandle {
                control_path: PathBuf::from(format!("/tmp/fake-{}.ctl", remote.name)),
                established_at: Utc::now(),
            })
        }

        async fn check(&self, _remote: &RemoteConfig, _handle: &ConnectionHandle) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.check_ok.load(Ordering::SeqCst)
        }

        async fn exec(
            &self,
            _remote: &RemoteConfig,
            _handle: &ConnectionHandle,
            _command: &str,
        ) -> Result<Vec<u8>> {
            self.execs.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.exec_failures) {
                bail!("channel open failed");
            }
            Ok(self.output.clone())
        }

        async fn close(&self, _remote: &RemoteConfig, _handle: &ConnectionHandle) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn remote(name: &str) -> RemoteConfig {
        RemoteConfig {
            name: name.into(),
            host: format!("{name}.example.com"),
            user: "dev".into(),
            key: PathBuf::from("/keys/test"),
            session_dir: None,
            jump_host: None,
        }
    }

    fn pool_with(transport: Arc<FakeTransport>, names: &[&str]) -> ConnectionPool {
        let remotes = names.iter().map(|n| remote(n)).collect();
        ConnectionPool::new(remotes, transport, DebugLog::disabled())
    }

    #[tokio::test]
    async fn test_connect_caches_and_reuses() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        pool.connect("box").await.unwrap();
        pool.connect("box").await.unwrap();

        // One dial; the second call probed and reused.
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.checks.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status("box").unwrap().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_probe_redials() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        pool.connect("box").await.unwrap();
        transport.check_ok.store(false, Ordering::SeqCst);
        pool.connect("box").await.unwrap();

        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        let transport = Arc::new(FakeTransport::new(b""));
        transport.connect_failures.store(1, Ordering::SeqCst);
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        assert!(pool.connect("box").await.is_err());
        let status = pool.status("box").unwrap();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.last_error.as_deref().unwrap().contains("dial failed"));
        assert!(status.last_poll.is_some());

        // No retry happened on its own.
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_returns_output() {
        let transport = Arc::new(FakeTransport::new(b"hello"));
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        let out = pool.execute("box", "echo hi").await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_execute_retries_channel_open_once() {
        let transport = Arc::new(FakeTransport::new(b"ok"));
        transport.exec_failures.store(1, Ordering::SeqCst);
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        let out = pool.execute("box", "cmd").await.unwrap();
        assert_eq!(out, b"ok");
        // Failed channel forced a reconnect and a second exec.
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.execs.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status("box").unwrap().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_second_failure() {
        let transport = Arc::new(FakeTransport::new(b""));
        transport.exec_failures.store(2, Ordering::SeqCst);
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        assert!(pool.execute("box", "cmd").await.is_err());
        assert_eq!(transport.execs.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status("box").unwrap().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_unknown_remote() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(transport, &["box"]);
        assert!(pool.execute("nope", "cmd").await.is_err());
    }

    #[tokio::test]
    async fn test_status_accessors_return_copies() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        let before = pool.status("box").unwrap();
        assert_eq!(before.state, ConnectionState::Disconnected);

        pool.connect("box").await.unwrap();

        // The copy taken earlier is unaffected by the pool's mutation.
        assert_eq!(before.state, ConnectionState::Disconnected);
        assert_eq!(pool.status("box").unwrap().state, ConnectionState::Connected);

        let all = pool.all_status();
        assert_eq!(all.len(), 1);
        assert_eq!(all["box"].state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_resets_status() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(Arc::clone(&transport), &["box"]);

        pool.connect("box").await.unwrap();
        pool.disconnect("box").await;

        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        let status = pool.status("box").unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_none());

        // Safe with nothing cached.
        pool.disconnect("box").await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let transport = Arc::new(FakeTransport::new(b""));
        let pool = pool_with(Arc::clone(&transport), &["a", "b"]);

        pool.connect("a").await.unwrap();
        pool.connect("b").await.unwrap();
        pool.close_all().await;

        assert_eq!(transport.closes.load(Ordering::SeqCst), 2);
        for status in pool.all_status().values() {
            assert_eq!(status.state, ConnectionState::Disconnected);
        }
    }
}
