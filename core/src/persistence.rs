//! Persistence codec: one session maps to one `{id}.state` file under the
//! configured state directory. Format is a `KEY=VALUE` header, a sentinel
//! line, then the raw (already-linearised) buffer bytes.

use std::path::{Path, PathBuf};

use crate::buffer::CircularBuffer;
use crate::error::SessionError;
use crate::session::SessionRecord;
use crate::session_id::SessionId;

const SESSION_VERSION: u32 = 1;
const SENTINEL: &str = "---BUFFER_DATA---";

const DEFAULT_RESTORED_NAME: &str = "Restored Session";

/// Render one session record into the on-disk header+buffer format.
fn encode(record: &SessionRecord) -> Vec<u8> {
    let snapshot = record.buffer.snapshot();
    let mut out = String::new();
    out.push_str(&format!("SESSION_VERSION={SESSION_VERSION}\n"));
    out.push_str(&format!("ID={}\n", sanitise(record.id.as_str())));
    out.push_str(&format!("NAME={}\n", sanitise(&record.name)));
    out.push_str(&format!("COMMAND={}\n", sanitise(&record.command)));
    out.push_str(&format!(
        "WORKING_DIR={}\n",
        sanitise(&record.working_directory)
    ));
    out.push_str(&format!("CREATED_AT={}\n", record.created_at));
    out.push_str(&format!("LAST_ACCESSED={}\n", record.last_accessed));
    out.push_str(&format!("TERMINAL_COLS={}\n", record.terminal_cols));
    out.push_str(&format!("TERMINAL_ROWS={}\n", record.terminal_rows));
    out.push_str(&format!("PROCESS_PID={}\n", record.process_pid));
    out.push_str(&format!("TOTAL_BYTES={}\n", record.total_bytes_written));
    out.push_str(&format!("SAVE_COUNT={}\n", record.save_count + 1));
    out.push_str(&format!("BUFFER_SIZE={}\n", snapshot.len()));
    out.push_str(SENTINEL);
    out.push('\n');

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&snapshot);
    bytes
}

/// Values must not contain `=` or LF; strip both so a malicious or buggy
/// name/command/cwd can never corrupt the header framing.
fn sanitise(value: &str) -> String {
    value.chars().filter(|&c| c != '=' && c != '\n').collect()
}

/// Write `record` to `{state_dir}/{id}.state` atomically: write to a sibling
/// temp file, then rename over the target.
pub fn save(state_dir: &Path, record: &SessionRecord) -> Result<(), SessionError> {
    std::fs::create_dir_all(state_dir).map_err(|e| SessionError::from_io(state_dir, e))?;
    let path = state_path(state_dir, &record.id);
    let tmp = path.with_extension("state.tmp");
    let bytes = encode(record);
    std::fs::write(&tmp, &bytes).map_err(|e| SessionError::from_io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| SessionError::from_io(&path, e))?;
    Ok(())
}

pub fn state_path(state_dir: &Path, id: &SessionId) -> PathBuf {
    state_dir.join(format!("{}.state", id.as_str()))
}

/// Result of decoding one `.state` file's bytes into a record, independent
/// of the filename it was read from (the caller cross-checks the stem).
pub struct Decoded {
    pub id: SessionId,
    pub name: String,
    pub command: String,
    pub working_directory: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    pub process_pid: u32,
    pub total_bytes_written: u64,
    pub save_count: u64,
    pub buffer_bytes: Vec<u8>,
}

/// Decode a `.state` file's raw bytes. `path` is used only for error
/// diagnostics. The filename-stem/id cross-check is the caller's job, since
/// this function doesn't know what filename it was loaded from.
pub fn decode(path: &Path, data: &[u8]) -> Result<Decoded, SessionError> {
    let sentinel_pos = find_sentinel(data).ok_or_else(|| SessionError::CorruptedState {
        path: path.to_path_buf(),
        reason: "missing ---BUFFER_DATA--- sentinel".to_string(),
    })?;

    let header_text = std::str::from_utf8(&data[..sentinel_pos]).map_err(|_| {
        SessionError::CorruptedState {
            path: path.to_path_buf(),
            reason: "header is not valid UTF-8".to_string(),
        }
    })?;

    let mut fields = std::collections::HashMap::new();
    for line in header_text.lines() {
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((k, v)) => {
                fields.insert(k.to_string(), v.to_string());
            }
            None => {
                return Err(SessionError::CorruptedState {
                    path: path.to_path_buf(),
                    reason: format!("malformed header line: {line:?}"),
                });
            }
        }
    }

    let version: u32 = fields
        .get("SESSION_VERSION")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if version > SESSION_VERSION {
        return Err(SessionError::CorruptedState {
            path: path.to_path_buf(),
            reason: format!("unsupported SESSION_VERSION {version}"),
        });
    }

    let id_str = fields
        .get("ID")
        .cloned()
        .ok_or_else(|| SessionError::CorruptedState {
            path: path.to_path_buf(),
            reason: "missing ID field".to_string(),
        })?;
    let id = SessionId::parse(id_str).map_err(|_| SessionError::CorruptedState {
        path: path.to_path_buf(),
        reason: "ID field is not a valid session identifier".to_string(),
    })?;

    let buffer_size: u64 = fields
        .get("BUFFER_SIZE")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let buffer_start = sentinel_pos + SENTINEL.len() + 1; // skip sentinel + its LF
    let available = data.len().saturating_sub(buffer_start);
    if (available as u64) < buffer_size {
        return Err(SessionError::CorruptedState {
            path: path.to_path_buf(),
            reason: format!(
                "declared BUFFER_SIZE {buffer_size} exceeds {available} bytes actually present"
            ),
        });
    }
    let buffer_bytes = data[buffer_start..buffer_start + buffer_size as usize].to_vec();

    Ok(Decoded {
        id,
        name: fields
            .get("NAME")
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RESTORED_NAME.to_string()),
        command: fields
            .get("COMMAND")
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_shell),
        working_directory: fields
            .get("WORKING_DIR")
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_home),
        created_at: fields
            .get("CREATED_AT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_accessed: fields
            .get("LAST_ACCESSED")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        terminal_cols: fields
            .get("TERMINAL_COLS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::session::DEFAULT_COLS),
        terminal_rows: fields
            .get("TERMINAL_ROWS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::session::DEFAULT_ROWS),
        process_pid: fields
            .get("PROCESS_PID")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        total_bytes_written: fields
            .get("TOTAL_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        save_count: fields
            .get("SAVE_COUNT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        buffer_bytes,
    })
}

fn find_sentinel(data: &[u8]) -> Option<usize> {
    let needle = SENTINEL.as_bytes();
    data.windows(needle.len())
        .position(|w| w == needle)
        .filter(|&pos| pos == 0 || data[pos - 1] == b'\n')
}

/// Build a `SessionRecord` from decoded fields, validating the filename stem
/// against the encoded id and clamping an oversized buffer to capacity.
pub fn into_record(
    decoded: Decoded,
    expected_id: &SessionId,
    path: &Path,
    buffer_capacity: usize,
) -> Result<SessionRecord, SessionError> {
    if &decoded.id != expected_id {
        return Err(SessionError::CorruptedState {
            path: path.to_path_buf(),
            reason: format!(
                "ID field {} does not match filename stem {}",
                decoded.id, expected_id
            ),
        });
    }

    let mut record = SessionRecord::create(
        decoded.id,
        Some(decoded.name),
        Some(decoded.command),
        Some(decoded.working_directory),
        buffer_capacity,
    );
    record.created_at = decoded.created_at;
    record.last_accessed = decoded.last_accessed;
    record.terminal_cols = decoded.terminal_cols;
    record.terminal_rows = decoded.terminal_rows;
    record.process_pid = decoded.process_pid;
    record.total_bytes_written = decoded.total_bytes_written;
    record.save_count = decoded.save_count;
    record.buffer = CircularBuffer::from_linear(buffer_capacity, decoded.buffer_bytes);
    record.needs_save = false;
    Ok(record)
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(not(unix))]
fn default_shell() -> String {
    "cmd.exe".to_string()
}

fn default_home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SessionRecord {
        let id = SessionId::parse("test-session-01").unwrap();
        let mut r = SessionRecord::create(
            id,
            Some("Build".into()),
            Some("/bin/bash".into()),
            Some("/tmp".into()),
            64,
        );
        r.ingest(b"hello\n");
        r
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record();
        save(dir.path(), &record).unwrap();

        let path = state_path(dir.path(), &record.id);
        let data = std::fs::read(&path).unwrap();
        let decoded = decode(&path, &data).unwrap();
        let restored = into_record(decoded, &record.id, &path, 64).unwrap();

        assert_eq!(restored.id, record.id);
        assert_eq!(restored.name, record.name);
        assert_eq!(restored.command, record.command);
        assert_eq!(restored.working_directory, record.working_directory);
        assert_eq!(restored.terminal_cols, record.terminal_cols);
        assert_eq!(restored.terminal_rows, record.terminal_rows);
        assert_eq!(restored.save_count, record.save_count + 1);
        assert_eq!(restored.buffer.snapshot(), record.buffer.snapshot());
    }

    #[test]
    fn write_goes_through_tmp_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record();
        save(dir.path(), &record).unwrap();
        let tmp = state_path(dir.path(), &record.id).with_extension("state.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn unknown_header_keys_are_ignored() {
        let data = b"SESSION_VERSION=1\nID=abc\nBOGUS_FIELD=whatever\nBUFFER_SIZE=0\n---BUFFER_DATA---\n";
        let decoded = decode(Path::new("abc.state"), data).unwrap();
        assert_eq!(decoded.id.as_str(), "abc");
    }

    #[test]
    fn missing_fields_take_documented_defaults() {
        let data = b"SESSION_VERSION=1\nID=abc\n---BUFFER_DATA---\n";
        let decoded = decode(Path::new("abc.state"), data).unwrap();
        assert_eq!(decoded.name, DEFAULT_RESTORED_NAME);
        assert_eq!(decoded.total_bytes_written, 0);
        assert!(decoded.buffer_bytes.is_empty());
    }

    #[test]
    fn version_too_new_is_corrupted_state() {
        let data = b"SESSION_VERSION=99\nID=abc\n---BUFFER_DATA---\n";
        let err = decode(Path::new("abc.state"), data).unwrap_err();
        assert!(matches!(err, SessionError::CorruptedState { .. }));
    }

    #[test]
    fn mismatched_id_against_filename_is_corrupted_state() {
        let data = b"SESSION_VERSION=1\nID=other-id\nBUFFER_SIZE=0\n---BUFFER_DATA---\n";
        let decoded = decode(Path::new("abc.state"), data).unwrap();
        let expected = SessionId::parse("abc").unwrap();
        let err = into_record(decoded, &expected, Path::new("abc.state"), 64).unwrap_err();
        assert!(matches!(err, SessionError::CorruptedState { .. }));
    }

    #[test]
    fn truncated_buffer_segment_is_corrupted_state() {
        let data = b"SESSION_VERSION=1\nID=abc\nBUFFER_SIZE=100\n---BUFFER_DATA---\nshort";
        let err = decode(Path::new("abc.state"), data).unwrap_err();
        assert!(matches!(err, SessionError::CorruptedState { .. }));
    }

    #[test]
    fn oversized_buffer_size_is_clamped_to_capacity() {
        let mut record = sample_record();
        record.buffer = CircularBuffer::from_linear(64, vec![b'x'; 64]);
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &record).unwrap();
        let path = state_path(dir.path(), &record.id);
        let data = std::fs::read(&path).unwrap();
        let decoded = decode(&path, &data).unwrap();
        // restore with a smaller configured capacity than what was saved
        let restored = into_record(decoded, &record.id, &path, 16).unwrap();
        assert_eq!(restored.buffer.len(), 16);
        assert!(restored.buffer.is_full());
    }

    #[test]
    fn missing_sentinel_is_corrupted_state() {
        let data = b"SESSION_VERSION=1\nID=abc\n";
        let err = decode(Path::new("abc.state"), data).unwrap_err();
        assert!(matches!(err, SessionError::CorruptedState { .. }));
    }

    #[test]
    fn values_with_equals_or_newline_are_sanitised_on_write() {
        let mut record = sample_record();
        record.name = "weird=name\nwith break".to_string();
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &record).unwrap();
        let path = state_path(dir.path(), &record.id);
        let data = std::fs::read(&path).unwrap();
        let decoded = decode(&path, &data).unwrap();
        assert_eq!(decoded.name, "weirdnamewith break");
    }
}
