//! Reader for the append-only JSONL progress file agents write through hooks.
//!
//! Each line is a JSON object with a `type` field. Unknown types still count
//! as a sign of life. Malformed lines are skipped, an incomplete trailing line
//! is left for the next read, and a missing file simply yields nothing.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressLine {
    Heartbeat,
    Progress {
        message: String,
        percent: Option<u8>,
    },
    PlanReady {
        plan_path: Option<String>,
    },
    Other(String),
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default, alias = "planPath")]
    plan_path: Option<String>,
}

/// Parse one line. `None` for blank or malformed input.
pub fn parse_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            trace!(error = %e, "skipping malformed progress line");
            return None;
        }
    };
    let parsed = match raw.kind.as_str() {
        "heartbeat" => ProgressLine::Heartbeat,
        "progress" => ProgressLine::Progress {
            message: raw.message.unwrap_or_default(),
            percent: raw
                .percent
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 100.0).round() as u8),
        },
        "plan_ready" | "planReady" => ProgressLine::PlanReady {
            plan_path: raw.plan_path,
        },
        other => ProgressLine::Other(other.to_string()),
    };
    Some(parsed)
}

/// Lines read since the previous offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressBatch {
    pub lines: Vec<ProgressLine>,
    /// Offset to pass to the next [`read_new_lines`] call.
    pub next_offset: u64,
}

/// Read complete lines appended to `path` since `offset`.
///
/// A file shorter than `offset` is treated as truncated and read from the
/// start again.
pub fn read_new_lines(path: &Path, offset: u64) -> ProgressBatch {
    match try_read(path, offset) {
        Ok(batch) => batch,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "progress file unreadable");
            }
            ProgressBatch {
                lines: Vec::new(),
                next_offset: offset,
            }
        }
    }
}

fn try_read(path: &Path, offset: u64) -> std::io::Result<ProgressBatch> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = if len < offset { 0 } else { offset };

    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let consumed = match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx + 1,
        None => 0,
    };
    let lines = String::from_utf8_lossy(&buf[..consumed])
        .lines()
        .filter_map(parse_line)
        .collect();

    Ok(ProgressBatch {
        lines,
        next_offset: start + consumed as u64,
    })
}

/// Current size of `path`, or `None` if it cannot be stat'ed.
pub fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}
