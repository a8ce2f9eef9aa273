//! Log and data file path handling: commit/checkpoint naming, 20-digit
//! version formatting, and Hive-style partition path encoding.

use std::collections::HashMap;

use crate::error::{DeltaResult, Error};
use crate::Version;

/// Directory under the table root that holds the transaction log.
pub const LOG_DIR: &str = "_delta_log";
/// Pointer file naming the most recent checkpoint.
pub const LAST_CHECKPOINT_PATH: &str = "_delta_log/_last_checkpoint";
/// Directory under the table root that holds change-data files.
pub const CHANGE_DATA_DIR: &str = "_change_data";

/// Render a version as the 20-digit zero-padded decimal used in log file
/// names. Rejects negatives and values that do not fit in 20 digits.
pub fn format_version(version: i128) -> DeltaResult<String> {
    if version < 0 {
        return Err(Error::validation(format!(
            "log version must be non-negative, got {version}"
        )));
    }
    if version >= 10i128.pow(20) {
        return Err(Error::validation(format!(
            "log version {version} does not fit in 20 digits"
        )));
    }
    Ok(format!("{version:020}"))
}

/// What kind of file a `_delta_log` entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPathFileType {
    /// `<version>.json`, the delta file of one commit
    Commit,
    /// `<version>.checkpoint.json` or `<version>.checkpoint.parquet`
    Checkpoint,
}

/// A recognized path inside `_delta_log/`, relative to the table root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogPath {
    pub path: String,
    pub version: Version,
    pub file_type: LogPathFileType,
}

impl ParsedLogPath {
    pub fn commit(version: Version) -> Self {
        Self {
            path: format!("{LOG_DIR}/{version:020}.json"),
            version,
            file_type: LogPathFileType::Commit,
        }
    }

    pub fn checkpoint(version: Version) -> Self {
        Self {
            path: format!("{LOG_DIR}/{version:020}.checkpoint.json"),
            version,
            file_type: LogPathFileType::Checkpoint,
        }
    }

    /// Parse a path relative to the table root. Returns `None` for files that
    /// are not versioned log entries (`_last_checkpoint`, CRCs, temp files).
    pub fn try_parse(path: &str) -> Option<Self> {
        let file_name = path.strip_prefix(&format!("{LOG_DIR}/"))?;
        let (version_part, rest) = file_name.split_at(file_name.find('.')?);
        if version_part.len() != 20 || !version_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version: Version = version_part.parse().ok()?;
        let file_type = match rest {
            ".json" => LogPathFileType::Commit,
            ".checkpoint.json" | ".checkpoint.parquet" => LogPathFileType::Checkpoint,
            _ => return None,
        };
        Some(Self {
            path: path.to_string(),
            version,
            file_type,
        })
    }
}

/// Apply one URL-decode pass to a data file path. Hive writers may emit
/// singly- or doubly-encoded paths; callers decode once per encoding layer
/// before handing the path to storage.
pub fn decode_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-encode a partition value for use in a path segment.
pub fn encode_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Build the `col=val/` prefix for a data file from partition values, in
/// partition-column order.
pub fn partition_path(
    partition_columns: &[String],
    values: &HashMap<String, String>,
) -> String {
    let mut out = String::new();
    for column in partition_columns {
        let value = values.get(column).map(String::as_str).unwrap_or("");
        out.push_str(&encode_partition_value(column));
        out.push('=');
        out.push_str(&encode_partition_value(value));
        out.push('/');
    }
    out
}

/// Parse `col=val/` segments out of a data file path. Values stay strings.
pub fn extract_partition_values_from_path(path: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for segment in path.split('/') {
        if let Some((column, value)) = segment.split_once('=') {
            if !column.is_empty() {
                values.insert(decode_path(column), decode_path(value));
            }
        }
    }
    values
}
