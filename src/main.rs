//! Roost — observe and control coding-agent tmux sessions across local and
//! remote machines.
//!
//! Sessions report their state through per-session JSON status files; roost
//! reads the local status directory directly and reaches configured remotes
//! through a pooled, multiplexed shell connection. `roost watch` runs the
//! status-sync monitor and announces every transition.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use roost::logging::DebugLog;
use roost::monitor::{NotifyFn, SessionSource, StatusMonitor};
use roost::remote::config::{self, RemoteConfig};
use roost::remote::pool::{ConnectionPool, OpenSshTransport};
use roost::remote::{poll, protocol, run_local};
use roost::session::store::{default_status_dir, format_age, read_status_dir};
use roost::session::{SessionInfo, aggregate_metrics, sort_sessions};

/// Roost — watch the whole flock of agent sessions from one place.
#[derive(Parser)]
#[command(name = "roost", version, about)]
struct Cli {
    /// Remotes file (defaults to ~/.roost/remotes.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local status directory (defaults to ~/.roost/sessions).
    #[arg(long, global = true)]
    status_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions across the local machine and every remote.
    Status {
        /// Machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Poll for status transitions and announce them until interrupted.
    Watch {
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// Kill a session and remove its status file.
    Kill {
        session: String,
        /// Run on a configured remote instead of this machine.
        #[arg(long)]
        remote: Option<String>,
    },

    /// Rename a session and its status file.
    Rename {
        session: String,
        new_name: String,
        #[arg(long)]
        remote: Option<String>,
    },

    /// Mark a session dismissed in its status file.
    Dismiss {
        session: String,
        #[arg(long)]
        remote: Option<String>,
    },

    /// Print a session's pane text with control sequences stripped.
    Capture {
        session: String,
        #[arg(long)]
        remote: Option<String>,
    },

    /// Probe every configured remote and show connection status.
    Remotes,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let debug = DebugLog::from_env();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let remotes = config::load_remotes(&config_path)?;
    let status_dir = cli.status_dir.clone().unwrap_or_else(default_status_dir);

    let pool = Arc::new(ConnectionPool::new(
        remotes.clone(),
        Arc::new(OpenSshTransport::new(debug)),
        debug,
    ));

    match cli.command {
        Command::Status { json } => run_status(&pool, &remotes, &status_dir, json).await,
        Command::Watch { interval } => run_watch(pool, remotes, status_dir, interval).await,
        Command::Kill { session, remote } => {
            exec_session_command(&pool, &remotes, &status_dir, remote.as_deref(), |dir| {
                protocol::kill_session_command(&session, dir)
            })
            .await
        }
        Command::Rename {
            session,
            new_name,
            remote,
        } => {
            exec_session_command(&pool, &remotes, &status_dir, remote.as_deref(), |dir| {
                protocol::rename_session_command(&session, &new_name, dir)
            })
            .await
        }
        Command::Dismiss { session, remote } => {
            let now = chrono::Utc::now().timestamp();
            exec_session_command(&pool, &remotes, &status_dir, remote.as_deref(), |dir| {
                protocol::dismiss_session_command(&session, dir, now)
            })
            .await
        }
        Command::Capture { session, remote } => {
            run_capture(&pool, &remotes, &status_dir, remote.as_deref(), &session).await
        }
        Command::Remotes => run_remotes(&pool, &remotes).await,
    }
}

// ---------------------------------------------------------------------------
// Command execution plumbing
// ---------------------------------------------------------------------------

fn find_remote<'a>(remotes: &'a [RemoteConfig], name: &str) -> Result<&'a RemoteConfig> {
    remotes
        .iter()
        .find(|r| r.name == name)
        .ok_or_else(|| eyre!("unknown remote '{name}' — check the remotes file"))
}

/// Build a command against the right status directory and run it locally or
/// over the pool.
async fn run_for_target(
    pool: &Arc<ConnectionPool>,
    remotes: &[RemoteConfig],
    status_dir: &std::path::Path,
    remote: Option<&str>,
    build: impl Fn(&str) -> String,
) -> Result<Vec<u8>> {
    match remote {
        Some(name) => {
            let rc = find_remote(remotes, name)?;
            pool.execute(name, &build(rc.session_dir())).await
        }
        None => run_local(&build(&status_dir.display().to_string())).await,
    }
}

async fn exec_session_command(
    pool: &Arc<ConnectionPool>,
    remotes: &[RemoteConfig],
    status_dir: &std::path::Path,
    remote: Option<&str>,
    build: impl Fn(&str) -> String,
) -> Result<()> {
    let output = run_for_target(pool, remotes, status_dir, remote, build).await?;
    let text = String::from_utf8_lossy(&output);
    if !text.trim().is_empty() {
        eprint!("{text}");
    }
    pool.close_all().await;
    Ok(())
}

async fn run_capture(
    pool: &Arc<ConnectionPool>,
    remotes: &[RemoteConfig],
    status_dir: &std::path::Path,
    remote: Option<&str>,
    session: &str,
) -> Result<()> {
    let output = run_for_target(pool, remotes, status_dir, remote, |_| {
        protocol::capture_pane_command(session)
    })
    .await?;
    println!("{}", protocol::strip_ansi(&String::from_utf8_lossy(&output)));
    pool.close_all().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Fill in missing git snapshots, one bundled round trip per session —
/// status files written early in a session's lifecycle often lack them.
/// Best-effort: a non-repo directory or failed remote just stays bare.
async fn enrich_git(pool: &Arc<ConnectionPool>, sessions: &mut [SessionInfo]) {
    for s in sessions.iter_mut() {
        if s.git.is_some() || s.cwd.is_empty() {
            continue;
        }
        let command = protocol::git_info_command(&s.cwd);
        let output = if s.remote.is_empty() {
            run_local(&command).await
        } else {
            pool.execute(&s.remote, &command).await
        };
        if let Ok(bytes) = output {
            s.git = protocol::parse_git_info(&String::from_utf8_lossy(&bytes));
        }
    }
}

async fn run_status(
    pool: &Arc<ConnectionPool>,
    remotes: &[RemoteConfig],
    status_dir: &std::path::Path,
    json: bool,
) -> Result<()> {
    let mut sessions = read_status_dir(status_dir);
    sessions.extend(poll::poll_remote_sessions(pool, remotes).await);
    enrich_git(pool, &mut sessions).await;
    sort_sessions(&mut sessions);

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        pool.close_all().await;
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions.");
        pool.close_all().await;
        return Ok(());
    }

    for s in &sessions {
        let (status, source) = s.composite_status();
        let marker = match status {
            "permission" | "waiting" => "!",
            "working" => ">",
            _ => " ",
        };
        let host = if s.remote.is_empty() {
            "local"
        } else {
            s.remote.as_str()
        };
        let via = source.map(|a| format!(" (via {a})")).unwrap_or_default();
        let branch = s
            .git
            .as_ref()
            .map(|g| {
                let dirty = if g.dirty { "*" } else { "" };
                format!(" [{}{dirty}]", g.branch)
            })
            .unwrap_or_default();
        let message = if s.message.is_empty() {
            String::new()
        } else {
            format!("  {}", s.message)
        };
        println!(
            "{marker} {:<24} {:<12} {:<10} {:>8}{via}{branch}{message}",
            s.tmux_session,
            status,
            host,
            format_age(s.timestamp),
        );
    }

    if let Some(m) = aggregate_metrics(&sessions) {
        println!(
            "\ntokens {}in/{}out  api {}s  tools {}",
            m.input_tokens, m.output_tokens, m.api_duration_secs, m.tool_calls
        );
    }

    pool.close_all().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

/// Snapshot source for the monitor: the local status directory plus every
/// configured remote through the pool.
struct CombinedSource {
    status_dir: PathBuf,
    pool: Arc<ConnectionPool>,
    remotes: Vec<RemoteConfig>,
}

#[async_trait]
impl SessionSource for CombinedSource {
    async fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions = read_status_dir(&self.status_dir);
        sessions.extend(poll::poll_remote_sessions(&self.pool, &self.remotes).await);
        sessions
    }
}

async fn run_watch(
    pool: Arc<ConnectionPool>,
    remotes: Vec<RemoteConfig>,
    status_dir: PathBuf,
    interval: u64,
) -> Result<()> {
    let source = Arc::new(CombinedSource {
        status_dir,
        pool: Arc::clone(&pool),
        remotes,
    });

    // The announcement backend lives entirely behind this callback; here it
    // is a plain console line.
    let notify: NotifyFn = Arc::new(|key, status| {
        println!(
            "[{}] {key} -> {status}",
            chrono::Local::now().format("%H:%M:%S")
        );
    });

    let mut monitor = StatusMonitor::new(source, notify, Duration::from_secs(interval.max(1)));
    monitor.start(HashMap::new(), HashMap::new());
    eprintln!("[watch] polling every {interval}s — ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    monitor.stop().await;
    pool.close_all().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// remotes
// ---------------------------------------------------------------------------

async fn run_remotes(pool: &Arc<ConnectionPool>, remotes: &[RemoteConfig]) -> Result<()> {
    if remotes.is_empty() {
        println!("No remotes configured.");
        return Ok(());
    }

    for r in remotes {
        if let Err(e) = pool.connect(&r.name).await {
            eprintln!("[remotes] '{}': {e:#}", r.name);
        }
    }

    let status = pool.all_status();
    let mut names: Vec<&String> = status.keys().collect();
    names.sort();
    for name in names {
        let s = &status[name];
        let detail = s
            .last_error
            .as_deref()
            .map(|e| format!("  {e}"))
            .unwrap_or_default();
        println!("{:<16} {}{detail}", name, s.state);
    }

    pool.close_all().await;
    Ok(())
}
