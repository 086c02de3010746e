//! Axum WebSocket server: a single `/ws` route that attaches a client
//! connection to a persistent session, replays scrollback, and bridges
//! PTY output and input for as long as the socket stays open.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use session_core::config::Config;
use session_core::connection::{self, wire};
use session_core::pty;
use session_core::registry::Registry;
use session_core::session::{CloseReason, ConnectionSink};
use session_core::session_id::SessionId;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Config,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct WsQuery {
    session_id: String,
    #[serde(default)]
    cwd: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.session_id, query.cwd, state))
}

/// Bridges a [`ConnectionSink`] onto an outbound channel that a single task
/// drains into the real WebSocket sink. Keeps `send_output`/`close`
/// synchronous, as the trait requires, while the actual write is async.
struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionSink for WsSink {
    fn send_output(&self, data: Bytes) -> bool {
        self.tx.send(Message::Binary(data)).is_ok()
    }

    fn close(&self, reason: CloseReason) {
        let description = match reason {
            CloseReason::Displaced => "displaced by a newer connection",
            CloseReason::SessionClosed => "session closed",
        };
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: description.into(),
        })));
    }
}

async fn handle_socket(socket: WebSocket, raw_id: String, cwd: Option<String>, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let sink: Arc<dyn ConnectionSink> = Arc::new(WsSink { tx: out_tx });

    let id = match connection::attach(&state.registry, &raw_id, cwd, &sink) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, raw_id, "rejecting connection at attach");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: 1002,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let forward = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = connection::replay(&state.registry, &id, &sink, state.config.replay_chunk_size).await {
        warn!(session_id = %id, error = %e, "replay failed, closing connection");
        forward.abort();
        return;
    }

    let command = state.registry.with(&id, |r| r.command.clone());
    let working_directory = state
        .registry
        .with(&id, |r| PathBuf::from(r.working_directory.clone()));
    let (command, cwd_path) = match (command, working_directory) {
        (Some(c), Some(p)) => (c, p),
        _ => {
            warn!(session_id = %id, "session vanished before PTY could be spawned");
            connection::on_disconnect(&state.registry, &id);
            forward.abort();
            return;
        }
    };

    let (bridge, mut pty_rx, resize_tx, mut pty_state_rx) =
        match pty::spawn_pty(&command, Some(cwd_path)) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session_id = %id, error = %e, "failed to spawn PTY");
                connection::on_disconnect(&state.registry, &id);
                forward.abort();
                return;
            }
        };

    state
        .registry
        .with_mut(&id, |r| r.process_pid = bridge.process_id().unwrap_or(0));

    let paused = Arc::new(AtomicBool::new(false));

    run_session_loop(
        &state.registry,
        &id,
        &mut ws_rx,
        &mut pty_rx,
        &mut pty_state_rx,
        &bridge,
        &resize_tx,
        &paused,
    )
    .await;

    let _ = bridge.kill();
    connection::on_disconnect(&state.registry, &id);
    forward.abort();
    info!(session_id = %id, "connection closed");
}

/// Drives the per-connection event loop: client frames, PTY output, and PTY
/// run-state transitions, until the client disconnects or the PTY exits.
#[allow(clippy::too_many_arguments)]
async fn run_session_loop(
    registry: &Registry,
    id: &SessionId,
    ws_rx: &mut SplitStream<WebSocket>,
    pty_rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>,
    pty_state_rx: &mut tokio::sync::mpsc::Receiver<pty::PtyRunState>,
    bridge: &pty::PtyBridge,
    resize_tx: &pty::ResizeSender,
    paused: &Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            client_msg = ws_rx.next() => {
                match client_msg {
                    Some(Ok(Message::Binary(data))) => handle_client_frame(registry, id, &data, bridge, resize_tx, paused),
                    Some(Ok(Message::Text(text))) => handle_client_frame(registry, id, text.as_bytes(), bridge, resize_tx, paused),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session_id = %id, error = %e, "websocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            pty_chunk = pty_rx.recv() => {
                match pty_chunk {
                    Some(bytes) => {
                        if paused.load(Ordering::SeqCst) {
                            registry.with_mut(id, |r| r.ingest(&bytes));
                        } else {
                            connection::ingest_and_forward(registry, id, Bytes::from(bytes));
                        }
                    }
                    None => break,
                }
            }
            state = pty_state_rx.recv() => {
                if let Some(pty::PtyRunState::Exited { exit_code }) = state {
                    info!(session_id = %id, exit_code, "PTY process exited");
                    break;
                }
            }
        }
    }
}

fn handle_client_frame(
    registry: &Registry,
    id: &SessionId,
    data: &[u8],
    bridge: &pty::PtyBridge,
    resize_tx: &pty::ResizeSender,
    paused: &Arc<AtomicBool>,
) {
    let frame = match wire::decode_client_frame(data) {
        Ok(f) => f,
        Err(e) => {
            warn!(session_id = %id, error = %e, "dropping malformed client frame");
            return;
        }
    };

    match frame {
        wire::ClientFrame::Input(bytes) => {
            if let Ok(mut writer) = bridge.writer.lock() {
                let _ = std::io::Write::write_all(&mut *writer, &bytes);
            }
        }
        wire::ClientFrame::Resize(resize) => {
            let _ = resize_tx.send((resize.columns, resize.rows));
            registry.with_mut(id, |r| {
                let _ = r.resize(resize.columns, resize.rows);
            });
        }
        wire::ClientFrame::Pause => paused.store(true, Ordering::SeqCst),
        wire::ClientFrame::Resume => paused.store(false, Ordering::SeqCst),
        wire::ClientFrame::JsonControl(value) => {
            info!(session_id = %id, ?value, "received JSON control frame");
        }
    }
}
