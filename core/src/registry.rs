//! Registry: the root collection of session records, one entry per id.
//!
//! Mutation always happens under a single record's DashMap shard lock; there
//! is no separate registry-wide lock, so concurrent operations on different
//! sessions never contend with each other.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::persistence;
use crate::session::SessionRecord;
use crate::session_id::SessionId;

pub struct Registry {
    sessions: DashMap<SessionId, SessionRecord>,
    state_dir: PathBuf,
    buffer_capacity: usize,
}

impl Registry {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            state_dir: config.state_dir.clone(),
            buffer_capacity: config.buffer_capacity,
        })
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|r| r.is_active).count()
    }

    /// Create a new record with a generated id.
    pub fn create_new(
        &self,
        name: Option<String>,
        command: Option<String>,
        cwd: Option<String>,
    ) -> SessionId {
        let id = SessionId::generate();
        let record = SessionRecord::create(id.clone(), name, command, cwd, self.buffer_capacity);
        info!(session_id = %id, "session created");
        self.sessions.insert(id.clone(), record);
        id
    }

    /// Find by id; if absent, create with exactly the given id (a
    /// client-supplied id always wins over a generated one).
    pub fn attach_or_create(&self, id: SessionId, cwd: Option<String>) -> SessionId {
        if !self.sessions.contains_key(&id) {
            let record =
                SessionRecord::create(id.clone(), None, None, cwd, self.buffer_capacity);
            info!(session_id = %id, "session created via attach_or_create");
            self.sessions.insert(id.clone(), record);
        }
        id
    }

    /// Run `f` against the record for `id`, if present.
    pub fn with<R>(&self, id: &SessionId, f: impl FnOnce(&SessionRecord) -> R) -> Option<R> {
        self.sessions.get(id).map(|r| f(&r))
    }

    /// Run `f` against a mutable borrow of the record for `id`, if present.
    pub fn with_mut<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        self.sessions.get_mut(id).map(|mut r| f(&mut r))
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session: close any attached connection normally, delete its
    /// on-disk file, and drop it from the index.
    pub fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        let Some((_, mut record)) = self.sessions.remove(id) else {
            return Err(SessionError::NotFound { id: id.to_string() });
        };
        record.evict_connection(crate::session::CloseReason::SessionClosed);
        let path = persistence::state_path(&self.state_dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id = %id, error = %e, "failed to delete state file"),
        }
        info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// Flush every dirty record via the codec. Returns `(flushed, failed)`.
    pub fn save_all(&self, save_interval_secs: u64) -> (usize, usize) {
        let mut flushed = 0;
        let mut failed = 0;
        for mut entry in self.sessions.iter_mut() {
            if !entry.needs_saving(save_interval_secs) {
                continue;
            }
            match persistence::save(&self.state_dir, &entry) {
                Ok(()) => {
                    entry.mark_saved();
                    flushed += 1;
                }
                Err(e) => {
                    warn!(session_id = %entry.id, error = %e, "checkpoint failed, will retry");
                    failed += 1;
                }
            }
        }
        (flushed, failed)
    }

    /// Checkpoint exactly one record immediately, regardless of dirtiness.
    pub fn checkpoint_now(&self, id: &SessionId) -> Result<(), SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        persistence::save(&self.state_dir, &entry)?;
        entry.mark_saved();
        Ok(())
    }

    /// At startup: enumerate `{state_dir}/*.state`, decode each, and insert.
    /// Files whose stem isn't a valid id, or whose contents are corrupt, are
    /// quarantined (renamed to `.state.corrupt`) and skipped rather than
    /// treated as fatal.
    pub fn restore_from_disk(&self) -> Result<(), SessionError> {
        let dir = &self.state_dir;
        std::fs::create_dir_all(dir).map_err(|e| SessionError::from_io(dir.clone(), e))?;

        let entries = std::fs::read_dir(dir).map_err(|e| SessionError::from_io(dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("state") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = match SessionId::parse(stem) {
                Ok(id) => id,
                Err(_) => {
                    warn!(path = %path.display(), "skipping state file with invalid id stem");
                    continue;
                }
            };
            if self.sessions.contains_key(&id) {
                warn!(session_id = %id, "duplicate state file for id, keeping first encountered");
                continue;
            }

            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read state file");
                    continue;
                }
            };

            match persistence::decode(&path, &data)
                .and_then(|decoded| {
                    persistence::into_record(decoded, &id, &path, self.buffer_capacity)
                }) {
                Ok(record) => {
                    info!(session_id = %id, "session restored");
                    self.sessions.insert(id, record);
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "corrupted state file, quarantining");
                    quarantine(&path);
                }
            }
        }
        Ok(())
    }

    /// Maintenance-loop eviction sweep: mark inactive records older than
    /// `max_inactive_age_secs` for removal; if still over `soft_cap`, also
    /// remove the oldest remaining inactive records. Attached sessions are
    /// never evicted. Returns the number of records evicted.
    pub fn evict(&self, max_inactive_age_secs: u64, soft_cap: usize) -> usize {
        let now = crate::session::unix_now_secs();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|r| !r.is_active && now.saturating_sub(r.last_accessed) > max_inactive_age_secs)
            .map(|r| r.id.clone())
            .collect();

        let mut evicted = 0;
        for id in &stale {
            if self.checkpoint_then_remove(id) {
                evicted += 1;
            }
        }

        if self.sessions.len() > soft_cap {
            let mut candidates: Vec<(SessionId, u64)> = self
                .sessions
                .iter()
                .filter(|r| !r.is_active)
                .map(|r| (r.id.clone(), r.last_accessed))
                .collect();
            candidates.sort_by_key(|(_, last_accessed)| *last_accessed);
            let overage = self.sessions.len() - soft_cap;
            for (id, _) in candidates.into_iter().take(overage) {
                if self.checkpoint_then_remove(&id) {
                    evicted += 1;
                }
            }
        }
        evicted
    }

    fn checkpoint_then_remove(&self, id: &SessionId) -> bool {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            if let Err(e) = persistence::save(&self.state_dir, &entry) {
                warn!(session_id = %id, error = %e, "final checkpoint before eviction failed");
            } else {
                entry.mark_saved();
            }
        } else {
            return false;
        }
        self.sessions.remove(id);
        let path = persistence::state_path(&self.state_dir, id);
        let _ = std::fs::remove_file(&path);
        info!(session_id = %id, "session evicted");
        true
    }
}

fn quarantine(path: &std::path::Path) {
    let corrupt_path = path.with_extension("state.corrupt");
    if let Err(e) = std::fs::rename(path, &corrupt_path) {
        warn!(path = %path.display(), error = %e, "failed to quarantine corrupted state file");
    }
}
