use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Result, VmssError};

use super::{BYTES_LIMIT, TRUNCATED_SUFFIX};

const SUCCEEDED_PREFIXES: [&str; 2] = ["Enable succeeded: ", "Enable succeeded:\n"];

fn stream_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\n?\[(stdout|stderr)\]\n?").expect("marker regex is valid"))
}

/// Output of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stderr: String,
    /// Combined length of both streams before trimming.
    #[serde(skip)]
    raw_len: usize,
}

impl RunCommandResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let (stdout, stderr) = (stdout.into(), stderr.into());
        let raw_len = stdout.len() + stderr.len();
        Self {
            stdout,
            stderr,
            raw_len,
        }
    }

    /// Append the truncation marker to stdout when the combined untrimmed
    /// output reaches [`BYTES_LIMIT`]. Returns whether the marker was added.
    ///
    /// Output that is exactly at the limit without having been cut is marked
    /// as well; the API does not report whether it dropped anything.
    pub fn mark_truncated(&mut self) -> bool {
        if self.raw_len < BYTES_LIMIT {
            return false;
        }
        self.stdout.push_str(TRUNCATED_SUFFIX);
        true
    }
}

/// Split a runCommand status message into stdout and stderr.
///
/// Expected shape: `Enable succeeded: \n[stdout]\n<text>\n[stderr]\n<text>`.
/// The markers may also appear inline without the surrounding newlines.
pub fn parse_run_command_message(message: &str) -> Result<RunCommandResult> {
    let body = SUCCEEDED_PREFIXES
        .iter()
        .find_map(|prefix| message.strip_prefix(*prefix))
        .unwrap_or(message);

    let segments: Vec<&str> = stream_marker().split(body).collect();
    match segments.as_slice() {
        [_, stdout, stderr] => Ok(RunCommandResult {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            raw_len: stdout.len() + stderr.len(),
        }),
        _ => Err(VmssError::UnparseableResponse(message.to_string())),
    }
}
