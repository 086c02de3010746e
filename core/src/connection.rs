//! Connection adapter: attaches a transport-agnostic connection to a
//! session record, replays its scrollback, and wires up live forwarding.
//! The actual transport (WebSocket, etc.) lives in the server crate and
//! only needs to implement [`crate::session::ConnectionSink`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::registry::Registry;
use crate::session::{CloseReason, ConnectionSink};
use crate::session_id::SessionId;

/// Wire protocol tags and framing, shared between client- and server-bound
/// messages. Client and server tag spaces are independent byte values that
/// happen to overlap numerically; direction disambiguates them.
pub mod wire {
    use bytes::{BufMut, Bytes, BytesMut};

    use crate::error::SessionError;

    pub const TAG_INPUT: u8 = b'0';
    pub const TAG_RESIZE_TERMINAL: u8 = b'1';
    pub const TAG_PAUSE: u8 = b'2';
    pub const TAG_RESUME: u8 = b'3';
    pub const TAG_JSON_CONTROL: u8 = b'{';

    pub const TAG_OUTPUT: u8 = b'0';
    pub const TAG_SET_WINDOW_TITLE: u8 = b'1';
    pub const TAG_SET_PREFERENCES: u8 = b'2';

    #[derive(Debug, Clone, serde::Deserialize)]
    pub struct ResizePayload {
        pub columns: u16,
        pub rows: u16,
    }

    /// A decoded client → server frame.
    #[derive(Debug, Clone)]
    pub enum ClientFrame {
        Input(Bytes),
        Resize(ResizePayload),
        Pause,
        Resume,
        JsonControl(serde_json::Value),
    }

    /// Decode one raw WebSocket binary/text payload into a [`ClientFrame`].
    /// An empty payload or an unrecognised tag is a protocol error.
    pub fn decode_client_frame(data: &[u8]) -> Result<ClientFrame, SessionError> {
        let (&tag, rest) = data
            .split_first()
            .ok_or_else(|| SessionError::InvalidId {
                id: "<empty frame>".to_string(),
            })?;
        match tag {
            TAG_INPUT => Ok(ClientFrame::Input(Bytes::copy_from_slice(rest))),
            TAG_RESIZE_TERMINAL => {
                let payload: ResizePayload =
                    serde_json::from_slice(rest).map_err(|e| SessionError::InvalidId {
                        id: format!("malformed RESIZE_TERMINAL payload: {e}"),
                    })?;
                Ok(ClientFrame::Resize(payload))
            }
            TAG_PAUSE => Ok(ClientFrame::Pause),
            TAG_RESUME => Ok(ClientFrame::Resume),
            TAG_JSON_CONTROL => {
                let mut full = Vec::with_capacity(data.len());
                full.push(tag);
                full.extend_from_slice(rest);
                let value: serde_json::Value =
                    serde_json::from_slice(&full).map_err(|e| SessionError::InvalidId {
                        id: format!("malformed JSON control payload: {e}"),
                    })?;
                Ok(ClientFrame::JsonControl(value))
            }
            other => Err(SessionError::InvalidId {
                id: format!("unknown frame tag {other:#04x}"),
            }),
        }
    }

    pub fn encode_output(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(TAG_OUTPUT);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    pub fn encode_window_title(title: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(title.len() + 1);
        buf.put_u8(TAG_SET_WINDOW_TITLE);
        buf.extend_from_slice(title.as_bytes());
        buf.freeze()
    }

    pub fn encode_preferences(prefs: &serde_json::Value) -> Bytes {
        let body = serde_json::to_vec(prefs).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(TAG_SET_PREFERENCES);
        buf.extend_from_slice(&body);
        buf.freeze()
    }
}

/// Validate the id, look the record up (creating it if absent), and
/// displace any currently-attached connection before attaching `sink`.
/// Corresponds to steps 1-4 of the connection adapter.
pub fn attach(
    registry: &Registry,
    raw_id: &str,
    cwd: Option<String>,
    sink: &Arc<dyn ConnectionSink>,
) -> Result<SessionId, SessionError> {
    let id = SessionId::parse(raw_id)?;
    registry.attach_or_create(id.clone(), cwd);

    registry
        .with_mut(&id, |record| {
            if record.has_live_attachment() {
                info!(session_id = %id, "displacing existing connection");
                record.evict_connection(CloseReason::Displaced);
            }
            record.attach(Arc::downgrade(sink))
        })
        .ok_or_else(|| SessionError::NotFound { id: id.to_string() })??;

    info!(session_id = %id, "connection attached");
    Ok(id)
}

/// Replay the buffer snapshot to a newly-attached connection as a sequence
/// of OUTPUT frames of at most `chunk_size` payload bytes, yielding briefly
/// between frames so the transport can drain. Corresponds to step 5.
///
/// On any send failure the connection is detached and the failure is
/// propagated as an I/O error so the caller can close the transport.
pub async fn replay(
    registry: &Registry,
    id: &SessionId,
    sink: &Arc<dyn ConnectionSink>,
    chunk_size: usize,
) -> Result<(), SessionError> {
    let snapshot = registry
        .with(id, |r| r.buffer.snapshot())
        .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;

    let chunk_size = chunk_size.max(1);
    for chunk in snapshot.chunks(chunk_size) {
        let frame = wire::encode_output(chunk);
        if !sink.send_output(frame) {
            registry.with_mut(id, |r| r.detach());
            return Err(SessionError::from_io(
                PathBuf::from(id.to_string()),
                std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection closed during replay",
                ),
            ));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}

/// Append PTY output to the buffer (always) and forward it live to the
/// attached connection (if still attached). Corresponds to step 6.
pub fn ingest_and_forward(registry: &Registry, id: &SessionId, data: Bytes) {
    registry.with_mut(id, |record| {
        record.ingest(&data);
        if record.has_live_attachment() {
            let frame = wire::encode_output(&data);
            if !record.forward_live(frame) {
                warn!(session_id = %id, "live forward failed, detaching stale connection");
                record.detach();
            }
        }
    });
}

/// Detach the record and checkpoint it immediately. Corresponds to step 7.
pub fn on_disconnect(registry: &Registry, id: &SessionId) {
    registry.with_mut(id, |record| record.detach());
    if let Err(e) = registry.checkpoint_now(id) {
        warn!(session_id = %id, error = %e, "checkpoint on disconnect failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<Bytes>>,
        alive: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    impl ConnectionSink for RecordingSink {
        fn send_output(&self, data: Bytes) -> bool {
            if !self.alive.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().unwrap().push(data);
            true
        }
        fn close(&self, _reason: CloseReason) {
            self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn test_registry(dir: &std::path::Path) -> Arc<Registry> {
        Registry::new(&Config {
            state_dir: dir.to_path_buf(),
            buffer_capacity: 1024,
            ..Config::default()
        })
    }

    #[test]
    fn attach_rejects_malformed_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink: Arc<dyn ConnectionSink> = Arc::new(RecordingSink::new());
        let err = attach(&registry, "has space", None, &sink).unwrap_err();
        assert!(matches!(err, SessionError::InvalidId { .. }));
    }

    #[test]
    fn attach_creates_session_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink: Arc<dyn ConnectionSink> = Arc::new(RecordingSink::new());
        let id = attach(&registry, "my-session", None, &sink).unwrap();
        assert!(registry.exists(&id));
        assert_eq!(registry.with(&id, |r| r.is_active), Some(true));
    }

    #[test]
    fn second_attach_displaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink1 = Arc::new(RecordingSink::new());
        let sink1_dyn: Arc<dyn ConnectionSink> = sink1.clone();
        let id = attach(&registry, "shared", None, &sink1_dyn).unwrap();

        let sink2: Arc<dyn ConnectionSink> = Arc::new(RecordingSink::new());
        attach(&registry, "shared", None, &sink2).unwrap();

        assert!(!sink1.alive.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(id, SessionId::parse("shared").unwrap());
    }

    #[tokio::test]
    async fn replay_chunks_at_configured_size() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink = Arc::new(RecordingSink::new());
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();
        let id = attach(&registry, "chunked", None, &sink_dyn).unwrap();
        registry.with_mut(&id, |r| r.ingest(&vec![b'x'; 20_000]));

        replay(&registry, &id, &sink_dyn, 8_192).await.unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 8_193); // 1 tag byte + 8192 payload
        assert_eq!(frames[1].len(), 8_193);
        assert_eq!(frames[2].len(), 3_617); // 1 tag byte + 3616 payload
    }

    #[test]
    fn ingest_and_forward_appends_and_forwards_when_attached() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink = Arc::new(RecordingSink::new());
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();
        let id = attach(&registry, "live", None, &sink_dyn).unwrap();

        ingest_and_forward(&registry, &id, Bytes::from_static(b"hello"));

        assert_eq!(
            registry.with(&id, |r| r.buffer.snapshot()),
            Some(b"hello".to_vec())
        );
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn on_disconnect_detaches_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let sink: Arc<dyn ConnectionSink> = Arc::new(RecordingSink::new());
        let id = attach(&registry, "gone", None, &sink).unwrap();

        on_disconnect(&registry, &id);

        assert_eq!(registry.with(&id, |r| r.is_active), Some(false));
        assert!(crate::persistence::state_path(dir.path(), &id).exists());
    }
}
