//! Session record: in-memory state for one terminal session — identity,
//! metadata, scrollback buffer, and the (at most one) attached connection.

use std::sync::Weak;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::buffer::CircularBuffer;
use crate::error::SessionError;
use crate::session_id::SessionId;

pub const DEFAULT_NAME: &str = "Unnamed Session";
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Why a client's connection was closed by the core, independent of the
/// transport. The connection adapter's transport-side code maps this to
/// whatever close frame its protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection attached to the same session (last-writer-wins).
    Displaced,
    /// The session itself is gone (explicit close or eviction).
    SessionClosed,
}

/// Capability a connection adapter exposes to a session record: a way to
/// push OUTPUT bytes to the client and a way to force-close it. Implemented
/// by the transport layer (e.g. the WebSocket handler); the session record
/// only ever sees this narrow interface, never the transport itself.
pub trait ConnectionSink: Send + Sync {
    /// Write an OUTPUT frame. Returns `false` if the transport is gone.
    fn send_output(&self, data: Bytes) -> bool;
    /// Force-close the connection with the given reason.
    fn close(&self, reason: CloseReason);
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One logical terminal: identity, metadata, scrollback, and the (weak)
/// handle to whichever connection is currently attached, if any.
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub command: String,
    pub working_directory: String,
    pub created_at: u64,
    pub last_accessed: u64,
    pub last_saved: u64,
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    pub process_pid: u32,
    pub buffer: CircularBuffer,
    pub is_active: bool,
    pub needs_save: bool,
    pub total_bytes_written: u64,
    pub save_count: u64,
    attached_connection: Option<Weak<dyn ConnectionSink>>,
}

impl SessionRecord {
    pub fn create(
        id: SessionId,
        name: Option<String>,
        command: Option<String>,
        working_directory: Option<String>,
        buffer_capacity: usize,
    ) -> Self {
        let now = unix_now_secs();
        Self {
            id,
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            command: command.unwrap_or_else(default_shell),
            working_directory: working_directory.unwrap_or_else(default_home),
            created_at: now,
            last_accessed: now,
            last_saved: 0,
            terminal_cols: DEFAULT_COLS,
            terminal_rows: DEFAULT_ROWS,
            process_pid: 0,
            buffer: CircularBuffer::new(buffer_capacity),
            is_active: false,
            needs_save: true,
            total_bytes_written: 0,
            save_count: 0,
            attached_connection: None,
        }
    }

    /// Whether a live connection is currently attached. A stale `Weak` whose
    /// target has already been dropped counts as detached.
    pub fn has_live_attachment(&self) -> bool {
        self.attached_connection
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    pub fn rename(&mut self, new_name: &str) -> Result<(), SessionError> {
        if new_name.is_empty() {
            return Err(SessionError::InvalidId {
                id: new_name.to_string(),
            });
        }
        self.name = new_name.to_string();
        self.mark_dirty();
        Ok(())
    }

    /// Attach `conn` as the session's connection. Fails with `AttachConflict`
    /// if another live connection already holds the slot — the caller's
    /// policy (last-writer-wins displacement) is implemented by the
    /// connection adapter, which detaches first and retries.
    pub fn attach(&mut self, conn: Weak<dyn ConnectionSink>) -> Result<(), SessionError> {
        if self.has_live_attachment() {
            return Err(SessionError::AttachConflict {
                id: self.id.to_string(),
            });
        }
        self.attached_connection = Some(conn);
        self.is_active = true;
        self.last_accessed = unix_now_secs();
        self.mark_dirty();
        Ok(())
    }

    /// Idempotent: clears the attachment whether or not one was present.
    pub fn detach(&mut self) {
        self.attached_connection = None;
        self.is_active = false;
        self.last_accessed = unix_now_secs();
        self.mark_dirty();
    }

    /// Append PTY output to the scrollback buffer. Total, never fails.
    pub fn ingest(&mut self, bytes: &[u8]) {
        self.buffer.append(bytes);
        self.total_bytes_written += bytes.len() as u64;
        self.last_accessed = unix_now_secs();
        self.mark_dirty();
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidId {
                id: format!("{cols}x{rows}"),
            });
        }
        self.terminal_cols = cols;
        self.terminal_rows = rows;
        self.mark_dirty();
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.needs_save = true;
    }

    /// True iff the record should be checkpointed: either it was mutated
    /// since the last successful save, or the save interval has elapsed.
    pub fn needs_saving(&self, save_interval_secs: u64) -> bool {
        self.needs_save || unix_now_secs().saturating_sub(self.last_saved) > save_interval_secs
    }

    pub fn mark_saved(&mut self) {
        self.needs_save = false;
        self.last_saved = unix_now_secs();
        self.save_count += 1;
    }

    /// Send a live output frame to the attached connection, if any is still
    /// live. Returns `true` if the frame was handed to a connection.
    pub fn forward_live(&self, data: Bytes) -> bool {
        match self.attached_connection.as_ref().and_then(Weak::upgrade) {
            Some(conn) => conn.send_output(data),
            None => false,
        }
    }

    /// Force-close and clear whatever connection is currently attached.
    pub fn evict_connection(&mut self, reason: CloseReason) {
        if let Some(conn) = self.attached_connection.take().and_then(|w| w.upgrade()) {
            conn.close(reason);
        }
        self.is_active = false;
    }
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
    use std::sync::Arc;

    struct NullSink;
    impl ConnectionSink for NullSink {
        fn send_output(&self, _data: Bytes) -> bool {
            true
        }
        fn close(&self, _reason: CloseReason) {}
    }

    fn record() -> SessionRecord {
        SessionRecord::create(
            SessionId::generate(),
            Some("Build".into()),
            Some("/bin/bash".into()),
            Some("/tmp".into()),
            1024,
        )
    }

    #[test]
    fn create_sets_defaults() {
        let r = record();
        assert_eq!(r.name, "Build");
        assert_eq!(r.terminal_cols, DEFAULT_COLS);
        assert_eq!(r.terminal_rows, DEFAULT_ROWS);
        assert!(r.needs_save);
        assert!(!r.is_active);
    }

    #[test]
    fn empty_name_falls_back_to_default() {
        let r = SessionRecord::create(SessionId::generate(), Some(String::new()), None, None, 1024);
        assert_eq!(r.name, DEFAULT_NAME);
    }

    #[test]
    fn rename_rejects_empty() {
        let mut r = record();
        assert!(r.rename("").is_err());
        assert!(r.rename("new name").is_ok());
        assert_eq!(r.name, "new name");
    }

    #[test]
    fn attach_then_second_attach_conflicts() {
        let mut r = record();
        let sink: Arc<dyn ConnectionSink> = Arc::new(NullSink);
        r.attach(Arc::downgrade(&sink)).unwrap();
        assert!(r.is_active);

        let sink2: Arc<dyn ConnectionSink> = Arc::new(NullSink);
        let err = r.attach(Arc::downgrade(&sink2)).unwrap_err();
        assert!(matches!(err, SessionError::AttachConflict { .. }));
    }

    #[test]
    fn detach_is_idempotent() {
        let mut r = record();
        r.detach();
        r.detach();
        assert!(!r.is_active);
    }

    #[test]
    fn attach_after_detach_succeeds() {
        let mut r = record();
        let sink: Arc<dyn ConnectionSink> = Arc::new(NullSink);
        r.attach(Arc::downgrade(&sink)).unwrap();
        r.detach();
        let sink2: Arc<dyn ConnectionSink> = Arc::new(NullSink);
        assert!(r.attach(Arc::downgrade(&sink2)).is_ok());
    }

    #[test]
    fn dropped_sink_counts_as_detached() {
        let mut r = record();
        {
            let sink: Arc<dyn ConnectionSink> = Arc::new(NullSink);
            r.attach(Arc::downgrade(&sink)).unwrap();
        }
        // sink dropped; weak handle is now stale.
        assert!(!r.has_live_attachment());
        let sink2: Arc<dyn ConnectionSink> = Arc::new(NullSink);
        assert!(r.attach(Arc::downgrade(&sink2)).is_ok());
    }

    #[test]
    fn ingest_updates_counters_and_buffer() {
        let mut r = record();
        r.mark_saved();
        r.ingest(b"hello\n");
        assert_eq!(r.total_bytes_written, 6);
        assert_eq!(r.buffer.snapshot(), b"hello\n");
        assert!(r.needs_save);
    }

    #[test]
    fn resize_rejects_zero_dimensions() {
        let mut r = record();
        assert!(r.resize(0, 24).is_err());
        assert!(r.resize(80, 0).is_err());
        assert!(r.resize(100, 40).is_ok());
        assert_eq!(r.terminal_cols, 100);
        assert_eq!(r.terminal_rows, 40);
    }

    #[test]
    fn needs_saving_true_after_mutation() {
        let r = record();
        assert!(r.needs_saving(30));
    }

    #[test]
    fn needs_saving_false_right_after_save() {
        let mut r = record();
        r.mark_saved();
        assert!(!r.needs_saving(30));
    }

    #[test]
    fn needs_saving_true_once_interval_elapsed() {
        let mut r = record();
        r.mark_saved();
        r.last_saved = 0; // pretend it was saved a long time ago
        assert!(r.needs_saving(30));
    }
}
