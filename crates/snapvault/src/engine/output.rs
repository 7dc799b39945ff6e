//! Typed views over the engine's JSON output, and failure classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::log_sanitize::clean_engine_line;
use crate::snapshots::Snapshot;

const LOCKED_EXIT_CODE: i32 = 11;
const WRONG_PASSWORD_EXIT_CODE: i32 = 12;
const REPOSITORY_MISSING_EXIT_CODE: i32 = 10;
const STDERR_TAIL_LINES: usize = 8;

const MISSING_MARKERS: &[&str] = &[
    "repository does not exist",
    "is there a repository at the following location",
    "the specified key does not exist",
    "the specified bucket does not exist",
    "nosuchbucket",
];
// Older engines print the "is there a repository" hint for transport errors too.
const TRANSPORT_MARKERS: &[&str] = &[
    "dial tcp",
    "no such host",
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake",
    "context deadline exceeded",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    #[serde(rename = "files_new", default)]
    pub new_files: u64,
    #[serde(rename = "files_changed", default)]
    pub changed_files: u64,
    #[serde(rename = "files_unmodified", default)]
    pub unchanged_files: u64,
    #[serde(rename = "data_added", default)]
    pub bytes_added: u64,
    #[serde(rename = "total_bytes_processed", default)]
    pub bytes_processed: u64,
    #[serde(rename = "total_duration", default)]
    pub duration_seconds: f64,
    /// Absent for dry runs.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub total_size: u64,
    #[serde(default)]
    pub total_uncompressed_size: Option<u64>,
    #[serde(default)]
    pub compression_ratio: Option<f64>,
    #[serde(rename = "total_blob_count", default)]
    pub blob_count: Option<u64>,
    #[serde(default)]
    pub snapshots_count: Option<u64>,
}

/// Counts from a `forget --json` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForgetReport {
    pub kept: usize,
    pub removed: usize,
}

#[derive(Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    keep: Option<Vec<Value>>,
    #[serde(default)]
    remove: Option<Vec<Value>>,
}

/// The last stdout line that parses as a `summary` message wins; earlier
/// status lines and any non-JSON noise are ignored.
pub fn parse_backup_summary(stdout: &[String]) -> Result<BackupSummary> {
    for line in stdout.iter().rev() {
        let Ok(v) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if v.get("message_type").and_then(Value::as_str) != Some("summary") {
            continue;
        }
        return serde_json::from_value(v).map_err(|e| {
            Error::ProcessProtocol(format!("malformed backup summary: {e}"))
        });
    }
    Err(Error::ProcessProtocol(
        "backup finished without a summary record".into(),
    ))
}

/// `null` and empty output both mean "no snapshots".
pub fn parse_snapshots(stdout: &str) -> Result<Vec<Snapshot>> {
    let raw = stdout.trim();
    if raw.is_empty() || raw == "null" {
        return Ok(Vec::new());
    }
    let list: Option<Vec<Snapshot>> = serde_json::from_str(raw)
        .map_err(|e| Error::ProcessProtocol(format!("malformed snapshot list: {e}")))?;
    Ok(list.unwrap_or_default())
}

pub fn parse_stats(stdout: &str) -> Result<RepositoryStats> {
    let raw = stdout.trim();
    // Some engine versions print progress before the JSON object.
    let start = raw.find('{').ok_or_else(|| {
        Error::ProcessProtocol("stats output contained no JSON object".into())
    })?;
    serde_json::from_str(&raw[start..])
        .map_err(|e| Error::ProcessProtocol(format!("malformed repository stats: {e}")))
}

/// Tolerant: prune chatter after the JSON array is ignored, and a missing
/// array yields zero counts.
pub fn parse_forget(stdout: &[String]) -> ForgetReport {
    let mut report = ForgetReport::default();
    for line in stdout {
        let line = line.trim();
        if !line.starts_with('[') {
            continue;
        }
        let Ok(groups) = serde_json::from_str::<Option<Vec<ForgetGroup>>>(line) else {
            continue;
        };
        for g in groups.unwrap_or_default() {
            report.kept += g.keep.map(|v| v.len()).unwrap_or(0);
            report.removed += g.remove.map(|v| v.len()).unwrap_or(0);
        }
        break;
    }
    report
}

/// Map a nonzero exit to the error taxonomy. Lock contention and a wrong
/// passphrase get dedicated messages; everything else carries the exit code
/// and the tail of stderr with secrets scrubbed.
pub fn classify_failure(
    action: &str,
    code: Option<i32>,
    stderr: &[String],
    secrets: &[&str],
) -> Error {
    let text = stderr.join("\n").to_ascii_lowercase();
    let tail = stderr_tail(stderr, secrets);

    if code == Some(LOCKED_EXIT_CODE)
        || text.contains("repository is already locked")
        || text.contains("unable to create lock")
    {
        return Error::RepositoryLocked(format!(
            "{action}: another engine process holds the lock; retry later or run `restic unlock` \
             if no other process is running ({tail})"
        ));
    }
    if code == Some(WRONG_PASSWORD_EXIT_CODE) || text.contains("wrong password") {
        return Error::ProcessExecution(format!(
            "{action}: wrong repository passphrase (check --passphrase, SNAPVAULT_PASSPHRASE \
             or the stored passphrase)"
        ));
    }
    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    if tail.is_empty() {
        Error::ProcessExecution(format!("{action} exited with {code}"))
    } else {
        Error::ProcessExecution(format!("{action} exited with {code}: {tail}"))
    }
}

/// True when a failed `cat config` means "nothing has been initialized here
/// yet", as opposed to a repository that exists but could not be opened.
pub fn repository_missing(code: Option<i32>, stderr: &[String]) -> bool {
    match code {
        Some(REPOSITORY_MISSING_EXIT_CODE) => return true,
        Some(LOCKED_EXIT_CODE | WRONG_PASSWORD_EXIT_CODE) | None => return false,
        Some(_) => {}
    }
    let text = stderr.join("\n").to_ascii_lowercase();
    if text.contains("wrong password") || TRANSPORT_MARKERS.iter().any(|m| text.contains(m)) {
        return false;
    }
    MISSING_MARKERS.iter().any(|m| text.contains(m))
}

fn stderr_tail(stderr: &[String], secrets: &[&str]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_LINES);
    stderr[start..]
        .iter()
        .map(|l| clean_engine_line(l, secrets))
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}
