// ============================================================================
// BACKGROUND PERSISTENCE: cache snapshots and the session file
// ============================================================================
//
// Every write runs on the rayon pool and reports back through the Dispatcher.
// Failures are logged and left for the next trigger; nothing here ever blocks or
// fails the foreground edit that caused it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::canvas::RasterDocument;
use crate::dispatch::{Dispatcher, WorkspaceEvent};
use crate::error::{EngineError, Result};
use crate::io;
use crate::project::TabId;

pub const SESSION_VERSION: u32 = 1;

// ============================================================================
// SESSION FILE
// ============================================================================

/// Per-tab metadata needed to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: TabId,
    pub original_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub is_dirty: bool,
    pub is_new: bool,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Persisted workspace state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    pub version: u32,
    /// Open tabs, in tab order.
    pub tabs: Vec<SessionEntry>,
    /// Closed dirty tabs whose backups are kept for restore.
    #[serde(default)]
    pub retained: Vec<SessionEntry>,
    pub active_tab: Option<TabId>,
    /// Navigation order; a superset of the open tabs' paths.
    #[serde(default)]
    pub known_paths: Vec<PathBuf>,
    pub saved_at: DateTime<Utc>,
}

impl SessionFile {
    pub fn order(&self) -> Vec<TabId> {
        self.tabs.iter().map(|t| t.id).collect()
    }
}

/// Serialize to `path` via temp file + rename.
pub fn write_session_file(path: &Path, file: &SessionFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| EngineError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| EngineError::io(path, e))
}

/// `Ok(None)` when no session was ever written.
pub fn load_session(path: &Path) -> Result<Option<SessionFile>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::io(path, e)),
    };
    let file: SessionFile = serde_json::from_slice(&raw)?;
    if file.version > SESSION_VERSION {
        log::warn!(
            "session: {} has version {}, newer than {}; reading best effort",
            path.display(),
            file.version,
            SESSION_VERSION
        );
    }
    Ok(Some(file))
}

// ============================================================================
// WRITER
// ============================================================================

/// Background snapshot and session writer.
#[derive(Debug)]
pub struct BackgroundPersistence {
    dispatcher: Dispatcher,
    session_path: PathBuf,
    next_generation: u64,
    /// Newest session generation that reached disk. Holding the lock also
    /// serializes concurrent session writes.
    written_generation: Arc<Mutex<u64>>,
}

impl BackgroundPersistence {
    pub fn new(dispatcher: Dispatcher, session_path: PathBuf) -> Self {
        Self {
            dispatcher,
            session_path,
            next_generation: 0,
            written_generation: Arc::new(Mutex::new(0)),
        }
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Write `document` (history state `state` of `tab`) to `path` off-thread.
    pub fn request_backup(&self, tab: TabId, state: u64, document: Arc<RasterDocument>, path: PathBuf) {
        let dispatcher = self.dispatcher.clone();
        rayon::spawn(move || {
            let event = match io::write_png(&document, &path) {
                Ok(()) => {
                    log::info!("Backup OK  {}  →  {}", tab, path.display());
                    WorkspaceEvent::BackupWritten {
                        tab,
                        state,
                        path,
                        at: Utc::now(),
                    }
                }
                Err(e) => {
                    log::error!("Backup FAILED for {}: {}", tab, e);
                    WorkspaceEvent::BackupFailed {
                        tab,
                        state,
                        error: e.to_string(),
                    }
                }
            };
            // Let the owner reclaim the buffer without copying.
            drop(document);
            dispatcher.post(event);
        });
    }

    /// Queue a session rewrite. Returns its generation; a newer generation that
    /// lands first makes older queued writes no-ops.
    pub fn write_session(&mut self, file: SessionFile) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let path = self.session_path.clone();
        let written = self.written_generation.clone();
        let dispatcher = self.dispatcher.clone();
        rayon::spawn(move || {
            let mut last = written.lock();
            if *last >= generation {
                log::debug!("session: generation {} superseded by {}", generation, *last);
                dispatcher.post(WorkspaceEvent::SessionWritten { generation, path });
                return;
            }
            let event = match write_session_file(&path, &file) {
                Ok(()) => {
                    *last = generation;
                    WorkspaceEvent::SessionWritten { generation, path }
                }
                Err(e) => {
                    log::error!("session: write failed: {}", e);
                    WorkspaceEvent::SessionWriteFailed {
                        generation,
                        error: e.to_string(),
                    }
                }
            };
            drop(last);
            dispatcher.post(event);
        });
        generation
    }

    /// Synchronous rewrite for shutdown paths.
    pub fn write_session_now(&mut self, file: &SessionFile) -> Result<()> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let mut last = self.written_generation.lock();
        write_session_file(&self.session_path, file)?;
        *last = generation;
        Ok(())
    }
}
