//! External PTY collaborator: spawn a command in a pseudo-terminal and
//! bridge stdin/stdout to the session core. The collaborator only knows how
//! to produce bytes and accept bytes/resizes; it has no idea about
//! sessions, buffers, or connections.
//!
//! Child is wrapped in a `Mutex` so a dedicated thread can poll `try_wait()`
//! and report run state without blocking the PTY reader thread.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

use crate::session::DEFAULT_COLS;
use crate::session::DEFAULT_ROWS;

/// Build the command to run: a login shell unless an explicit command line
/// was configured for the session. Injects TERM/COLORTERM so the PTY is
/// seen as a modern 256/truecolor terminal by whatever sits at the other
/// end of the connection.
fn command_for(command: &str, cwd: Option<&Path>) -> CommandBuilder {
    let mut c = if let Some(dir) = cwd {
        #[cfg(unix)]
        {
            let path = dir.to_string_lossy();
            let escaped = path.replace('\'', "'\"'\"'");
            let line = format!("cd '{escaped}' && exec {command}");
            let mut wrap = CommandBuilder::new("bash");
            wrap.arg("-c");
            wrap.arg(line);
            wrap
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
            CommandBuilder::new(command)
        }
    } else {
        #[cfg(unix)]
        {
            let mut wrap = CommandBuilder::new("bash");
            wrap.arg("-c");
            wrap.arg(command);
            wrap
        }
        #[cfg(not(unix))]
        {
            CommandBuilder::new(command)
        }
    };
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    c
}

/// Run state of the PTY child process.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyRunState {
    Running,
    Exited { exit_code: u32 },
}

/// PTY bridge: writer for stdin. The reader runs on a background thread and
/// is consumed through the `mpsc::Receiver` returned by `spawn_pty`. The
/// child handle is kept alive so the process isn't reaped early; a separate
/// thread polls `try_wait()` to detect its exit.
pub struct PtyBridge {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

/// Sender to request a PTY resize (cols, rows); a dedicated thread applies
/// it to the master side.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Spawn `command` in a PTY, optionally rooted at `cwd`. Returns the
/// bridge, a receiver of raw PTY output chunks, a resize sender, and a
/// receiver of run-state transitions.
pub fn spawn_pty(
    command: &str,
    cwd: Option<std::path::PathBuf>,
) -> Result<
    (
        PtyBridge,
        mpsc::Receiver<Vec<u8>>,
        ResizeSender,
        mpsc::Receiver<PtyRunState>,
    ),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows: DEFAULT_ROWS,
        cols: DEFAULT_COLS,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let cmd = command_for(command, cwd.as_deref());
    let child = pair.slave.spawn_command(cmd)?;

    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (state_tx, state_rx) = mpsc::channel::<PtyRunState>(10);

    let child = Arc::new(Mutex::new(child));

    // Blocking thread: read PTY stdout and forward to the async side.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resize requests to the PTY master.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            let _ = master.resize(size);
        }
    });

    // Poll try_wait(); report Running once, then Exited when the process ends.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || {
        let mut sent_running = false;
        loop {
            let exit_status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(s)) => Some(s.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(code) = exit_status {
                let _ = state_tx.blocking_send(PtyRunState::Exited { exit_code: code });
                break;
            }
            if !sent_running {
                sent_running = true;
                let _ = state_tx.blocking_send(PtyRunState::Running);
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    });

    let bridge = PtyBridge {
        writer: Arc::new(Mutex::new(writer)),
        child,
    };
    Ok((bridge, rx, resize_tx, state_rx))
}

impl PtyBridge {
    /// Kill the child process, e.g. when the owning session is destroyed.
    pub fn kill(&self) -> Result<(), std::io::Error> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }

    /// OS process id of the spawned child, if the platform exposes one.
    pub fn process_id(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|g| g.process_id())
    }
}
