//! WebSocket front end for the session core: wires the `/ws` route to the
//! registry, connection adapter, and PTY collaborator.

mod web_server;

pub use web_server::{app, AppState};
