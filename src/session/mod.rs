//! Session status model — the `SessionInfo` record, status ranking,
//! composite status across primary + sub-agents, and priority-aware sorting.
//!
//! Pure data and logic; no I/O lives here. Records are read-only snapshots:
//! once constructed they are never mutated, only replaced wholesale by the
//! next poll.

pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Status ranking ────────────────────────────────────────

/// Known statuses, highest priority first. A session's place in the list
/// decides both composite-status computation and sort order.
pub const STATUS_PRIORITY: [&str; 7] = [
    "permission",
    "waiting",
    "working",
    "error",
    "idle",
    "stopped",
    "done",
];

/// Position of a status in the priority list. Unrecognized statuses rank
/// one past the end — they sort last but are never an error.
pub fn status_rank(status: &str) -> usize {
    STATUS_PRIORITY
        .iter()
        .position(|s| *s == status)
        .unwrap_or(STATUS_PRIORITY.len())
}

/// Statuses that mean a human has to act.
fn is_priority_status(status: &str) -> bool {
    status == "waiting" || status == "permission"
}

// ── Types mirroring the per-session status file ───────────

/// One tracked session, deserialized from its JSON status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session name — unique key within its host.
    pub tmux_session: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub cwd: String,

    /// Current work item, carried through verbatim for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pbi: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pbi_title: Option<String>,

    /// Last update, unix seconds.
    #[serde(default)]
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,

    /// Remote-host label; empty for local sessions. Filled in when the
    /// record was fetched from a configured remote.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,

    /// Ordered team of named sub-agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,

    /// External agents keyed by name. May coexist with `team`; both feed
    /// the same ranking path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<HashMap<String, AgentState>>,
}

/// Snapshot of the session's git checkout. Absent for non-repo directories
/// and early in a session's lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub last_commit: String,
    #[serde(default)]
    pub remote_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

/// Usage counters a session may report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub api_duration_secs: u64,
    #[serde(default)]
    pub tool_calls: u64,
}

/// A named team of sub-agents attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub agents: Vec<TeamAgent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamAgent {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Status of one external agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}

// ── Composite status ──────────────────────────────────────

impl SessionInfo {
    /// All sub-agent (name, status) pairs, from the team list and the
    /// external-agent map alike, sorted by name. Both composition forms
    /// share this one path so the ranking logic never diverges.
    pub fn sub_agents(&self) -> Vec<(&str, &str)> {
        let mut subs: Vec<(&str, &str)> = Vec::new();
        if let Some(team) = &self.team {
            for agent in &team.agents {
                subs.push((agent.name.as_str(), agent.status.as_str()));
            }
        }
        if let Some(agents) = &self.agents {
            for (name, state) in agents {
                subs.push((name.as_str(), state.status.as_str()));
            }
        }
        subs.sort_by(|a, b| a.0.cmp(b.0));
        subs
    }

    /// The single highest-priority status across the primary status and
    /// every sub-agent, with the winning agent's name as the source.
    ///
    /// The primary wins ties against agents. Equal-rank agents tie-break
    /// to the lexicographically smallest name; this is arbitrary but must
    /// stay stable because downstream consumers key off the source name.
    pub fn composite_status(&self) -> (&str, Option<&str>) {
        let subs = self.sub_agents();
        if subs.is_empty() {
            return (self.status.as_str(), None);
        }

        let mut best_rank = status_rank(&self.status);
        let mut best: (&str, Option<&str>) = (self.status.as_str(), None);
        for (name, status) in subs {
            let rank = status_rank(status);
            if rank < best_rank {
                best_rank = rank;
                best = (status, Some(name));
            }
        }
        best
    }

    /// True iff any team member is waiting for input or permission,
    /// regardless of which status wins the composite.
    pub fn has_priority_teammate(&self) -> bool {
        self.team
            .as_ref()
            .is_some_and(|t| t.agents.iter().any(|a| is_priority_status(&a.status)))
    }

    /// True iff any external agent is waiting for input or permission.
    pub fn has_priority_external_agent(&self) -> bool {
        self.agents
            .as_ref()
            .is_some_and(|m| m.values().any(|a| is_priority_status(&a.status)))
    }
}

// ── Sorting ───────────────────────────────────────────────

/// Sort tier for one session: 0 = needs attention, 1 = actively working,
/// 2 = everything else.
fn sort_tier(session: &SessionInfo) -> u8 {
    let (status, _) = session.composite_status();
    let rank = status_rank(status);
    if rank <= status_rank("waiting")
        || session.has_priority_teammate()
        || session.has_priority_external_agent()
    {
        0
    } else if rank == status_rank("working") {
        1
    } else {
        2
    }
}

/// Order sessions for display: anything needing attention first, then
/// active work, then the rest; newest first within each tier. Idle or
/// done sessions never outrank active work, however recently touched.
pub fn sort_sessions(sessions: &mut [SessionInfo]) {
    sessions.sort_by(|a, b| {
        sort_tier(a)
            .cmp(&sort_tier(b))
            .then(b.timestamp.cmp(&a.timestamp))
    });
}

// ── Metrics aggregation ───────────────────────────────────

/// Sum usage counters across every session that reports them. Returns
/// `None` when no session carries metrics — callers must be able to tell
/// "nothing reported" apart from an all-zero total.
pub fn aggregate_metrics(sessions: &[SessionInfo]) -> Option<Metrics> {
    let mut total = Metrics::default();
    let mut seen = false;
    for session in sessions {
        if let Some(m) = &session.metrics {
            seen = true;
            total.input_tokens += m.input_tokens;
            total.output_tokens += m.output_tokens;
            total.api_duration_secs += m.api_duration_secs;
            total.tool_calls += m.tool_calls;
        }
    }
    seen.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str, status: &str, timestamp: i64) -> SessionInfo {
        SessionInfo {
            tmux_session: name.into(),
            status: status.into(),
            message: String::new(),
            cwd: "/tmp".into(),
            current_pbi: None,
            current_pbi_title: None,
            timestamp,
            git: None,
            remote: String::new(),
            metrics: None,
            team: None,
            agents: None,
        }
    }

    fn with_agents(mut s: SessionInfo, agents: &[(&str, &str)]) -> SessionInfo {
        let map = agents
            .iter()
            .map(|(n, st)| {
                (
                    n.to_string(),
                    AgentState {
                        status: st.to_string(),
                        timestamp: 0,
                    },
                )
            })
            .collect();
        s.agents = Some(map);
        s
    }

    #[test]
    fn test_status_rank_order() {
        assert!(status_rank("permission") < status_rank("waiting"));
        assert!(status_rank("waiting") < status_rank("working"));
        assert!(status_rank("working") < status_rank("error"));
        assert!(status_rank("error") < status_rank("idle"));
        assert!(status_rank("idle") < status_rank("stopped"));
        assert!(status_rank("stopped") < status_rank("done"));
    }

    #[test]
    fn test_unknown_status_ranks_last() {
        assert_eq!(status_rank("wat"), STATUS_PRIORITY.len());
        assert!(status_rank("wat") > status_rank("done"));
    }

    #[test]
    fn test_composite_no_agents_is_primary() {
        let s = session("a", "working", 0);
        assert_eq!(s.composite_status(), ("working", None));
    }

    #[test]
    fn test_composite_agent_wins() {
        let s = with_agents(
            session("a", "working", 0),
            &[("a", "idle"), ("b", "permission")],
        );
        assert_eq!(s.composite_status(), ("permission", Some("b")));
    }

    #[test]
    fn test_composite_lexical_tiebreak() {
        let s = with_agents(
            session("a", "done", 0),
            &[("y", "waiting"), ("x", "waiting")],
        );
        assert_eq!(s.composite_status(), ("waiting", Some("x")));
    }

    #[test]
    fn test_composite_primary_wins_ties() {
        let s = with_agents(session("a", "working", 0), &[("x", "working")]);
        assert_eq!(s.composite_status(), ("working", None));
    }

    #[test]
    fn test_composite_consults_team_and_agents() {
        let mut s = with_agents(session("a", "working", 0), &[("zed", "idle")]);
        s.team = Some(Team {
            name: "crew".into(),
            agents: vec![TeamAgent {
                name: "ana".into(),
                status: "permission".into(),
                timestamp: 0,
            }],
        });
        assert_eq!(s.composite_status(), ("permission", Some("ana")));
    }

    #[test]
    fn test_has_priority_teammate() {
        let mut s = session("a", "working", 0);
        s.team = Some(Team {
            name: "crew".into(),
            agents: vec![
                TeamAgent {
                    name: "one".into(),
                    status: "working".into(),
                    timestamp: 0,
                },
                TeamAgent {
                    name: "two".into(),
                    status: "waiting".into(),
                    timestamp: 0,
                },
            ],
        });
        assert!(s.has_priority_teammate());
        assert!(!s.has_priority_external_agent());
    }

    #[test]
    fn test_has_priority_external_agent() {
        let s = with_agents(session("a", "done", 0), &[("x", "permission")]);
        assert!(s.has_priority_external_agent());
        assert!(!s.has_priority_teammate());
    }

    #[test]
    fn test_sort_attention_floats_to_top() {
        let mut sessions = vec![
            session("w1", "working", 100),
            session("wait", "waiting", 50),
            session("perm", "permission", 75),
            session("w2", "working", 25),
        ];
        sort_sessions(&mut sessions);
        let order: Vec<&str> = sessions.iter().map(|s| s.tmux_session.as_str()).collect();
        // Tier 0 by timestamp desc, then the working pair by timestamp desc.
        assert_eq!(order, vec!["perm", "wait", "w1", "w2"]);
    }

    #[test]
    fn test_sort_idle_never_outranks_working() {
        let mut sessions = vec![
            session("idle-fresh", "idle", 1_000),
            session("work-old", "working", 10),
        ];
        sort_sessions(&mut sessions);
        assert_eq!(sessions[0].tmux_session, "work-old");
    }

    #[test]
    fn test_sort_priority_teammate_promotes_session() {
        let mut quiet = session("quiet", "done", 5);
        quiet.team = Some(Team {
            name: "crew".into(),
            agents: vec![TeamAgent {
                name: "helper".into(),
                status: "permission".into(),
                timestamp: 0,
            }],
        });
        let mut sessions = vec![session("busy", "working", 900), quiet];
        sort_sessions(&mut sessions);
        assert_eq!(sessions[0].tmux_session, "quiet");
    }

    #[test]
    fn test_aggregate_metrics_none_when_absent() {
        let sessions = vec![session("a", "working", 0), session("b", "idle", 0)];
        assert_eq!(aggregate_metrics(&sessions), None);
    }

    #[test]
    fn test_aggregate_metrics_sums() {
        let mut a = session("a", "working", 0);
        a.metrics = Some(Metrics {
            input_tokens: 10,
            output_tokens: 20,
            api_duration_secs: 5,
            tool_calls: 2,
        });
        let mut b = session("b", "idle", 0);
        b.metrics = Some(Metrics {
            input_tokens: 1,
            output_tokens: 2,
            api_duration_secs: 3,
            tool_calls: 4,
        });
        let c = session("c", "done", 0);

        let total = aggregate_metrics(&[a, b, c]).unwrap();
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 22);
        assert_eq!(total.api_duration_secs, 8);
        assert_eq!(total.tool_calls, 6);
    }

    #[test]
    fn test_deserialize_full_record() {
        let json = r#"{
            "tmux_session": "feature-auth",
            "status": "working",
            "message": "running tests",
            "cwd": "/home/dev/proj",
            "current_pbi": "PBI-42",
            "current_pbi_title": "Add OAuth",
            "timestamp": 1700000000,
            "git": {"branch": "main", "dirty": true, "ahead": 1, "behind": 2,
                    "last_commit": "fix auth", "remote_url": "git@example.com:x.git",
                    "pr_number": 7},
            "remote": "buildbox",
            "metrics": {"input_tokens": 5, "output_tokens": 6,
                        "api_duration_secs": 7, "tool_calls": 8},
            "team": {"name": "crew", "agents": [
                {"name": "reviewer", "status": "idle", "timestamp": 1}
            ]},
            "agents": {"scout": {"status": "waiting", "timestamp": 2}}
        }"#;
        let s: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(s.tmux_session, "feature-auth");
        assert_eq!(s.git.as_ref().unwrap().pr_number, Some(7));
        assert_eq!(s.remote, "buildbox");
        assert_eq!(s.team.as_ref().unwrap().agents.len(), 1);
        assert_eq!(s.agents.as_ref().unwrap()["scout"].status, "waiting");
        // Priority agent present, so the whole record needs attention.
        assert_eq!(s.composite_status(), ("waiting", Some("scout")));
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let s: SessionInfo =
            serde_json::from_str(r#"{"tmux_session": "bare"}"#).unwrap();
        assert_eq!(s.tmux_session, "bare");
        assert_eq!(s.status, "");
        assert!(s.git.is_none());
        assert!(s.team.is_none());
        assert!(s.agents.is_none());
        // Unknown (empty) status ranks last; still not an error.
        assert_eq!(s.composite_status(), ("", None));
    }

    #[test]
    fn test_unknown_status_sorts_to_bottom() {
        let mut sessions = vec![
            session("mystery", "definitely-not-a-status", 999),
            session("done", "done", 1),
        ];
        sort_sessions(&mut sessions);
        // Both tier 2; newest first.
        assert_eq!(sessions[0].tmux_session, "mystery");
        // But a working session beats both.
        let mut sessions = vec![
            session("mystery", "definitely-not-a-status", 999),
            session("busy", "working", 1),
        ];
        sort_sessions(&mut sessions);
        assert_eq!(sessions[0].tmux_session, "busy");
    }
}
