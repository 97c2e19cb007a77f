//! Status-sync monitor — polls session state on a fixed interval, diffs it
//! against the retained baseline, and fires one notification per observed
//! transition.
//!
//! Two states only: idle (not started) and polling. The interesting part is
//! the diff: [`MonitorCore`] owns the baseline maps and the transition
//! logic, pure and synchronous; [`StatusMonitor`] wraps it in a background
//! task with cooperative cancellation. Where the snapshot comes from (the
//! local status directory, the connection pool, or both) is the caller's
//! business, injected as a [`SessionSource`].

use crate::session::SessionInfo;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Supplies the current session records each tick.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn snapshot(&self) -> Vec<SessionInfo>;
}

/// Transition callback: `(key, new_status)`. The key is the session name,
/// or `session:agent` for a sub-agent transition. The announcement side
/// (cooldowns, sounds, speech) lives entirely behind this boundary; the
/// monitor neither knows nor waits for it.
pub type NotifyFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

// ── Diff logic ────────────────────────────────────────────

/// Baseline maps plus the transition diff. Owned exclusively by the
/// monitor; accessors hand out copies.
pub struct MonitorCore {
    baseline: HashMap<String, String>,
    agent_baseline: HashMap<String, HashMap<String, String>>,
    /// Set when started with empty seeds: the first tick only captures a
    /// baseline, because diffing pre-existing sessions against an empty
    /// map would misreport them all as fresh transitions.
    baseline_only: bool,
}

impl MonitorCore {
    pub fn new(
        seed_status: HashMap<String, String>,
        seed_agent_status: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        let baseline_only = seed_status.is_empty() && seed_agent_status.is_empty();
        Self {
            baseline: seed_status,
            agent_baseline: seed_agent_status,
            baseline_only,
        }
    }

    /// Diff one snapshot against the baseline, firing `notify` for every
    /// changed session and sub-agent status, then adopt the snapshot as
    /// the new baseline unconditionally.
    ///
    /// A session or agent absent from the baseline is a first sighting and
    /// never notifies; it will be diffed from the next tick on.
    pub fn observe(&mut self, records: &[SessionInfo], notify: &dyn Fn(&str, &str)) {
        let mut current: HashMap<String, String> = HashMap::new();
        let mut agent_current: HashMap<String, HashMap<String, String>> = HashMap::new();

        for record in records {
            current.insert(record.tmux_session.clone(), record.status.clone());
            let subs = record.sub_agents();
            if !subs.is_empty() {
                let agents = subs
                    .into_iter()
                    .map(|(name, status)| (name.to_string(), status.to_string()))
                    .collect();
                agent_current.insert(record.tmux_session.clone(), agents);
            }
        }

        if self.baseline_only {
            self.baseline_only = false;
        } else {
            for (session, status) in &current {
                if let Some(previous) = self.baseline.get(session) {
                    if previous != status {
                        notify(session, status);
                    }
                }
            }

            for (session, agents) in &agent_current {
                if let Some(previous_agents) = self.agent_baseline.get(session) {
                    for (agent, status) in agents {
                        if let Some(previous) = previous_agents.get(agent) {
                            if previous != status {
                                notify(&format!("{session}:{agent}"), status);
                            }
                        }
                    }
                }
            }
        }

        self.baseline = current;
        self.agent_baseline = agent_current;
    }

    pub fn states(&self) -> HashMap<String, String> {
        self.baseline.clone()
    }

    pub fn agent_states(&self) -> HashMap<String, HashMap<String, String>> {
        self.agent_baseline.clone()
    }
}

// ── Background task ───────────────────────────────────────

pub struct StatusMonitor {
    core: Arc<Mutex<MonitorCore>>,
    source: Arc<dyn SessionSource>,
    notify: NotifyFn,
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    pub fn new(source: Arc<dyn SessionSource>, notify: NotifyFn, interval: Duration) -> Self {
        Self {
            core: Arc::new(Mutex::new(MonitorCore::new(
                HashMap::new(),
                HashMap::new(),
            ))),
            source,
            notify,
            interval,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Start polling. The seed maps become the initial baseline — a caller
    /// handing off from a previous monitor passes its final state here so
    /// already-seen statuses are not re-announced. Empty seeds make the
    /// first tick baseline-only. No-op if already started.
    pub fn start(
        &mut self,
        seed_status: HashMap<String, String>,
        seed_agent_status: HashMap<String, HashMap<String, String>>,
    ) {
        if self.handle.is_some() {
            return;
        }

        *self.core.lock().expect("monitor lock") =
            MonitorCore::new(seed_status, seed_agent_status);

        let core = Arc::clone(&self.core);
        let source = Arc::clone(&self.source);
        let notify = Arc::clone(&self.notify);
        let cancel = self.cancel.clone();
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let records = source.snapshot().await;
                        core.lock()
                            .expect("monitor lock")
                            .observe(&records, &*notify);
                    }
                }
            }
        }));
    }

    /// Stop polling. Cooperative: a tick already in flight finishes before
    /// the loop exits.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Copy of the current session baseline, for display.
    pub fn states(&self) -> HashMap<String, String> {
        self.core.lock().expect("monitor lock").states()
    }

    /// Copy of the current per-agent baseline.
    pub fn agent_states(&self) -> HashMap<String, HashMap<String, String>> {
        self.core.lock().expect("monitor lock").agent_states()
    }
}
