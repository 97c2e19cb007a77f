//! Command builders and output parsers for the remote shell contract.
//!
//! Every intent (git info, session listing, kill/rename/dismiss, pane
//! capture) becomes one opaque shell command string — round trips dominate
//! latency over a remote link, so each builder bundles everything it needs
//! into a single execution. Parsers are defensive throughout: malformed or
//! concatenated JSON, missing git upstreams, and terminal control codes are
//! all absence of data, never failures.
//!
//! The same command strings run unchanged through `sh -c` for local
//! sessions; see [`crate::remote::run_local`].

use crate::session::{GitInfo, SessionInfo};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

// ── Shell quoting ─────────────────────────────────────────

/// Quote a string for a POSIX shell: wrap in single quotes, with embedded
/// single quotes spliced out as `'"'"'`. The result always evaluates back
/// to exactly the input, whatever it contains — session names are
/// user-controlled and must not escape their quoting.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Quote a directory for embedding in a command. A leading `~/` expands to
/// the executing user's home (session directories default to a path under
/// the remote home), everything else is quoted literally.
fn quote_dir(dir: &str) -> String {
    match dir.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(dir),
    }
}

/// Quoted path of a session's status file inside a status directory.
fn status_file(dir: &str, session: &str) -> String {
    format!("{}/{}", quote_dir(dir), shell_quote(&format!("{session}.json")))
}

// ── Git info ──────────────────────────────────────────────

/// Bundle the whole git snapshot into one round trip: five labeled lines,
/// each probe silenced so a missing repo or upstream just leaves its value
/// empty.
pub fn git_info_command(dir: &str) -> String {
    format!(
        concat!(
            "cd {dir} && ",
            "echo \"BRANCH:$(git rev-parse --abbrev-ref HEAD 2>/dev/null)\" && ",
            "echo \"DIRTY:$(git status --porcelain 2>/dev/null | head -1)\" && ",
            "echo \"AHEADBEHIND:$(git rev-list --left-right --count @{{upstream}}...HEAD 2>/dev/null)\" && ",
            "echo \"LASTCOMMIT:$(git log -1 --pretty=%s 2>/dev/null)\" && ",
            "echo \"REMOTEURL:$(git remote get-url origin 2>/dev/null)\""
        ),
        dir = shell_quote(dir),
    )
}

const GIT_LABELS: [&str; 5] = ["BRANCH", "DIRTY", "AHEADBEHIND", "LASTCOMMIT", "REMOTEURL"];

/// Parse bundled git-info output. An empty `BRANCH:` value means the
/// directory is not a repository — that is `None`, not an error, whatever
/// the other lines contain.
pub fn parse_git_info(output: &str) -> Option<GitInfo> {
    let mut fields: HashMap<&str, String> = HashMap::new();
    for line in output.lines() {
        for label in GIT_LABELS {
            if let Some(rest) = line.strip_prefix(label) {
                if let Some(value) = rest.strip_prefix(':') {
                    fields.insert(label, value.trim().to_string());
                }
            }
        }
    }

    let branch = fields.get("BRANCH")?;
    if branch.is_empty() {
        return None;
    }

    let (behind, ahead) =
        parse_ahead_behind(fields.get("AHEADBEHIND").map(String::as_str).unwrap_or(""));

    Some(GitInfo {
        branch: branch.clone(),
        dirty: fields.get("DIRTY").is_some_and(|d| !d.is_empty()),
        ahead,
        behind,
        last_commit: fields.get("LASTCOMMIT").cloned().unwrap_or_default(),
        remote_url: fields.get("REMOTEURL").cloned().unwrap_or_default(),
        pr_number: None,
    })
}

/// `git rev-list --left-right --count` emits "behind<TAB>ahead". Anything
/// that is not exactly two integers (missing upstream, error text) is
/// (0, 0).
fn parse_ahead_behind(value: &str) -> (u32, u32) {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 2 {
        return (0, 0);
    }
    match (parts[0].parse(), parts[1].parse()) {
        (Ok(behind), Ok(ahead)) => (behind, ahead),
        _ => (0, 0),
    }
}

// ── Session listing ───────────────────────────────────────

/// Concatenate every per-session status file in one round trip. The glob
/// stays outside the quotes; stderr is dropped so an empty directory reads
/// as no output.
pub fn list_sessions_command(dir: &str) -> String {
    format!("cat {}/*.json 2>/dev/null", quote_dir(dir))
}

/// Parse the concatenated dump of zero or more JSON status files.
///
/// `cat` joins the documents with no separating punctuation, so first try a
/// streaming decode (one object, then check for more). If that recovers
/// nothing, fall back to a byte scanner that tracks brace depth and string
/// state to cut out each top-level `{...}` span and parse it in isolation —
/// one corrupt file then cannot take down its neighbors. Every recovered
/// record is tagged with the originating remote's name.
pub fn parse_session_list(output: &[u8], remote: &str) -> Vec<SessionInfo> {
    let text = String::from_utf8_lossy(output);
    let mut sessions: Vec<SessionInfo> = Vec::new();

    let mut stream = serde_json::Deserializer::from_str(&text).into_iter::<SessionInfo>();
    for item in &mut stream {
        match item {
            Ok(session) => sessions.push(session),
            Err(_) => break,
        }
    }

    if sessions.is_empty() {
        for span in scan_json_objects(&text) {
            if let Ok(session) = serde_json::from_str::<SessionInfo>(span) {
                sessions.push(session);
            }
        }
    }

    if !remote.is_empty() {
        for session in &mut sessions {
            session.remote = remote.to_string();
        }
    }
    sessions
}

/// Recover top-level `{...}` spans from arbitrary text. Tracks brace depth
/// and double-quoted string state, honoring backslash escapes, so braces
/// inside JSON strings do not confuse the count.
fn scan_json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    spans
}

// ── Mutating commands ─────────────────────────────────────

/// Kill a session and remove its status file. Joined with `;` — the file
/// cleanup must run even when the tmux session is already gone.
pub fn kill_session_command(session: &str, dir: &str) -> String {
    format!(
        "tmux kill-session -t {name} 2>/dev/null ; rm -f {file}",
        name = shell_quote(session),
        file = status_file(dir, session),
    )
}

/// Rename a session: tmux rename, in-place field rewrite, then file move,
/// chained with `&&` — partial success would leave the session and its
/// status file disagreeing about the name.
pub fn rename_session_command(session: &str, new_name: &str, dir: &str) -> String {
    let rewrite = format!(
        "s/\"tmux_session\": *\"{old}\"/\"tmux_session\": \"{new}\"/",
        old = sed_escape_pattern(session),
        new = sed_escape_replacement(new_name),
    );
    format!(
        "tmux rename-session -t {old} {new} && sed -i {rewrite} {old_file} && mv {old_file} {new_file}",
        old = shell_quote(session),
        new = shell_quote(new_name),
        rewrite = shell_quote(&rewrite),
        old_file = status_file(dir, session),
        new_file = status_file(dir, new_name),
    )
}

/// Mark a session dismissed by rewriting status, message, and timestamp in
/// its status file.
pub fn dismiss_session_command(session: &str, dir: &str, now: i64) -> String {
    format!(
        concat!(
            "sed -i ",
            "-e 's/\"status\": *\"[^\"]*\"/\"status\": \"done\"/' ",
            "-e 's/\"message\": *\"[^\"]*\"/\"message\": \"Dismissed\"/' ",
            "-e 's/\"timestamp\": *[0-9]*/\"timestamp\": {now}/' ",
            "{file}"
        ),
        now = now,
        file = status_file(dir, session),
    )
}

/// Escape a literal string for use inside a `/`-delimited sed pattern.
fn sed_escape_pattern(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a literal string for use as a sed replacement.
fn sed_escape_replacement(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── Pane capture ──────────────────────────────────────────

/// Capture a session's visible pane text.
pub fn capture_pane_command(session: &str) -> String {
    format!("tmux capture-pane -p -t {}", shell_quote(session))
}

static CSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;:?]*[ -/]*[@-~]").expect("CSI pattern")
});
static OSC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\][^\x07]*\x07").expect("OSC pattern")
});
static CTRL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\x00-\x08\x0b-\x1f\x7f]").expect("control pattern")
});

/// Strip terminal escape sequences from captured pane text in three
/// passes: CSI sequences (`ESC [ ... letter`), OSC sequences
/// (`ESC ] ... BEL`), then any remaining control bytes outside tab and
/// newline. Trailing whitespace is trimmed last.
pub fn strip_ansi(input: &str) -> String {
    let pass1 = CSI_RE.replace_all(input, "");
    let pass2 = OSC_RE.replace_all(&pass1, "");
    let pass3 = CTRL_RE.replace_all(&pass2, "");
    pass3.trim_end().to_string()
}
