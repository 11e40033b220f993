// ============================================================================
// WORKSPACE: open tabs, the active pointer and everything that moves between them
// ============================================================================
//
// All tab state is mutated here, on the owning thread. Background jobs report via
// the Dispatcher and their results are applied in `pump_events`, one event at a
// time, so a tab is never observed half-updated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::canvas::RasterDocument;
use crate::dispatch::{self, Dispatcher, EventQueue, WorkspaceEvent};
use crate::error::{EngineError, Result};
use crate::io::{self, CacheDir, ExportTarget};
use crate::ops::batch::{
    BatchHandle, BatchJobRunner, BatchOperation, BatchProgress, BatchReport, BatchUnit, UnitOutput, UnitSource,
};
use crate::ops::transform;
use crate::persistence::{self, BackgroundPersistence, SESSION_VERSION, SessionEntry, SessionFile};
use crate::project::{TabId, TabSession};
use crate::settings::EngineSettings;

/// Canvas size used when a tab has to be recreated blank and never had a size.
const DEFAULT_CANVAS_SIZE: (u32, u32) = (800, 600);

/// Transient message for the user (failed saves, batch summaries).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub is_error: bool,
}

/// A closed dirty tab whose backup is kept until it is reopened or discarded.
#[derive(Debug)]
struct RetainedTab {
    entry: SessionEntry,
    /// State the final backup must reflect, while a write for this tab is outstanding.
    final_state: Option<u64>,
    /// Latest pixels, held until the final backup has landed.
    buffer: Option<Arc<RasterDocument>>,
    /// The final write starts once the older in-flight one reports back.
    write_deferred: bool,
}

impl RetainedTab {
    fn new(entry: SessionEntry) -> Self {
        Self {
            entry,
            final_state: None,
            buffer: None,
            write_deferred: false,
        }
    }
}

/// Where the pixels of a tab that was neither resident nor parked came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Recovered {
    CurrentBackup,
    SourceFile,
    StaleBackup,
    Blank,
}

#[derive(Debug)]
struct RunningBatch {
    handle: BatchHandle,
    total: usize,
    succeeded: usize,
    failed: Vec<(TabId, String)>,
    skipped: Vec<TabId>,
}

pub struct Workspace {
    settings: EngineSettings,
    cache: CacheDir,
    tabs: Vec<TabSession>,
    active: Option<TabId>,
    known_paths: Vec<PathBuf>,
    retained: Vec<RetainedTab>,
    untitled_counter: usize,
    dispatcher: Dispatcher,
    events: EventQueue,
    persistence: BackgroundPersistence,
    /// Background jobs whose completion event has not been applied yet.
    pending_jobs: usize,
    last_idle_backup: Instant,
    batch: Option<RunningBatch>,
    next_batch_id: u64,
    last_report: Option<BatchReport>,
    notifications: Vec<Notification>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("tabs", &self.tabs.len())
            .field("active", &self.active)
            .field("retained", &self.retained.len())
            .field("pending_jobs", &self.pending_jobs)
            .field("batch", &self.batch.as_ref().map(|b| b.handle.id))
            .finish()
    }
}

impl Workspace {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let cache = CacheDir::new(settings.resolved_cache_dir());
        cache.ensure()?;
        let (dispatcher, events) = dispatch::channel();
        let persistence = BackgroundPersistence::new(dispatcher.clone(), settings.session_path());
        log::info!("workspace: cache at {}", cache.root().display());
        Ok(Self {
            settings,
            cache,
            tabs: Vec::new(),
            active: None,
            known_paths: Vec::new(),
            retained: Vec::new(),
            untitled_counter: 0,
            dispatcher,
            events,
            persistence,
            pending_jobs: 0,
            last_idle_backup: Instant::now(),
            batch: None,
            next_batch_id: 0,
            last_report: None,
            notifications: Vec::new(),
        })
    }

    /// Open a workspace and restore the previous session when one exists.
    pub fn resume(settings: EngineSettings) -> Result<Self> {
        let mut workspace = Self::new(settings)?;
        if let Some(file) = persistence::load_session(workspace.persistence.session_path())? {
            workspace.restore_session(file)?;
        }
        Ok(workspace)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn tabs(&self) -> &[TabSession] {
        &self.tabs
    }

    pub fn tab_order(&self) -> Vec<TabId> {
        self.tabs.iter().map(|t| t.id).collect()
    }

    pub fn tab(&self, id: TabId) -> Option<&TabSession> {
        self.tabs.iter().find(|t| t.id == id)
    }

    pub fn tab_mut(&mut self, id: TabId) -> Option<&mut TabSession> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    pub fn active_id(&self) -> Option<TabId> {
        self.active
    }

    pub fn active_tab(&self) -> Option<&TabSession> {
        self.active.and_then(|id| self.tab(id))
    }

    pub fn active_tab_mut(&mut self) -> Option<&mut TabSession> {
        let id = self.active?;
        self.tab_mut(id)
    }

    pub fn known_paths(&self) -> &[PathBuf] {
        &self.known_paths
    }

    /// Session entries of closed tabs whose unsaved changes are kept in the cache.
    pub fn retained(&self) -> impl Iterator<Item = &SessionEntry> {
        self.retained.iter().map(|r| &r.entry)
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending_jobs
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn index_of(&self, id: TabId) -> Result<usize> {
        self.tabs
            .iter()
            .position(|t| t.id == id)
            .ok_or(EngineError::UnknownTab(id))
    }

    fn notify(&mut self, message: String, is_error: bool) {
        self.notifications.push(Notification { message, is_error });
    }

    // ========================================================================
    // OPENING TABS
    // ========================================================================

    /// Create a new untitled project and switch to it
    pub fn new_tab(&mut self, width: u32, height: u32) -> Result<TabId> {
        self.untitled_counter += 1;
        let tab = TabSession::new_untitled(self.untitled_counter, width, height, self.settings.history_limits());
        self.push_and_activate(tab)
    }

    /// New untitled tab holding pasted pixels.
    pub fn paste_image(&mut self, document: RasterDocument) -> Result<TabId> {
        self.untitled_counter += 1;
        let tab = TabSession::from_paste(self.untitled_counter, document, self.settings.history_limits());
        self.push_and_activate(tab)
    }

    /// Decode `path` into a new tab, or switch to the tab that already has it open.
    pub fn open_file(&mut self, path: &Path) -> Result<TabId> {
        if let Some(id) = self
            .retained
            .iter()
            .find(|r| r.entry.original_path.as_deref() == Some(path))
            .map(|r| r.entry.id)
        {
            for sibling in io::sibling_images(path) {
                self.remember_path(sibling);
            }
            return self.reopen_retained(id);
        }
        if let Some(id) = self
            .tabs
            .iter()
            .find(|t| t.file_path.as_deref() == Some(path))
            .map(|t| t.id)
        {
            self.switch_to_tab(id)?;
            return Ok(id);
        }
        let document = match io::load_document(path) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("open: {}", e);
                self.notify(format!("Could not open {}: {}", path.display(), e), true);
                return Err(e);
            }
        };
        for sibling in io::sibling_images(path) {
            self.remember_path(sibling);
        }
        self.remember_path(path.to_path_buf());
        let tab = TabSession::from_file(path.to_path_buf(), document, self.settings.history_limits());
        log::info!("open: {} as {}", path.display(), tab.id);
        self.push_and_activate(tab)
    }

    /// Open (or switch to) the known path `step` entries away from the active tab's
    /// file, wrapping around. `None` when the active tab has no file.
    pub fn navigate(&mut self, step: isize) -> Result<Option<TabId>> {
        let Some(current) = self.active_tab().and_then(|t| t.file_path.clone()) else {
            return Ok(None);
        };
        let Some(pos) = self.known_paths.iter().position(|p| *p == current) else {
            return Ok(None);
        };
        let len = self.known_paths.len() as isize;
        let next = (pos as isize + step).rem_euclid(len) as usize;
        let path = self.known_paths[next].clone();
        self.open_file(&path).map(Some)
    }

    fn remember_path(&mut self, path: PathBuf) {
        if !self.known_paths.contains(&path) {
            self.known_paths.push(path);
        }
    }

    fn push_and_activate(&mut self, tab: TabSession) -> Result<TabId> {
        let id = tab.id;
        self.tabs.push(tab);
        self.switch_to_tab(id)?;
        Ok(id)
    }

    // ========================================================================
    // SWITCHING
    // ========================================================================

    /// Make `id` the active tab.
    ///
    /// The outgoing tab gets a fresh thumbnail and its buffer is parked for a
    /// background backup. The incoming tab is loaded from the first available of:
    /// resident buffer, parked buffer, backup file, source file, blank canvas.
    pub fn switch_to_tab(&mut self, id: TabId) -> Result<()> {
        let target = self.index_of(id)?;
        if self.active == Some(id) {
            self.load_tab(target);
            return Ok(());
        }

        if let Some(prev) = self.active
            && let Ok(prev_idx) = self.index_of(prev)
        {
            self.deactivate(prev_idx);
        }

        self.load_tab(target);
        self.active = Some(id);
        log::debug!("switch: active tab is now {}", id);
        self.queue_session_write();
        Ok(())
    }

    fn deactivate(&mut self, idx: usize) {
        let max_dim = self.settings.thumbnail_max_dim;
        let tab = &mut self.tabs[idx];
        if tab.history.is_stroke_active() {
            // Leaving mid-stroke keeps the pixels painted so far.
            if let Err(e) = tab.commit_stroke("Stroke") {
                log::warn!("switch: could not commit open stroke on {}: {}", tab.id, e);
            }
        }
        if let Some(thumbnail) = tab.document().map(|doc| transform::make_thumbnail(doc, max_dim)) {
            tab.thumbnail = Some(thumbnail);
        }
        tab.park();
        self.request_tab_backup(idx);
    }

    fn load_tab(&mut self, idx: usize) {
        let tab = &mut self.tabs[idx];
        if tab.is_resident() || tab.reclaim() {
            return;
        }
        tab.is_loading = true;
        let (document, recovered) = self.read_unloaded(idx);
        self.settle_unloaded(idx, recovered);
        self.tabs[idx].install_document(document);
    }

    /// Read the buffer of a tab that is neither resident nor parked. The tab itself
    /// is untouched; `settle_unloaded` applies what the source means for its history.
    fn read_unloaded(&self, idx: usize) -> (RasterDocument, Recovered) {
        let tab = &self.tabs[idx];
        let id = tab.id;
        let backup = tab.backup_path.as_ref().filter(|p| p.exists());
        let backup_is_current = backup.is_some() && tab.backup_state == Some(tab.history.current_state());

        if backup_is_current && let Some(path) = backup {
            match io::load_document(path) {
                Ok(doc) => return (doc, Recovered::CurrentBackup),
                Err(e) => log::warn!("load: backup of {} unreadable: {}", id, e),
            }
        }
        if let Some(path) = &tab.file_path {
            match io::load_document(path) {
                Ok(doc) => return (doc, Recovered::SourceFile),
                Err(e) => log::warn!("load: source of {} unreadable: {}", id, e),
            }
        }
        if !backup_is_current && let Some(path) = backup {
            match io::load_document(path) {
                Ok(doc) => return (doc, Recovered::StaleBackup),
                Err(e) => log::warn!("load: backup of {} unreadable: {}", id, e),
            }
        }
        let (w, h) = match tab.last_known_size {
            (0, _) | (_, 0) => DEFAULT_CANVAS_SIZE,
            size => size,
        };
        log::warn!("load: nothing readable for {}, starting blank {}x{}", id, w, h);
        (RasterDocument::new(w, h), Recovered::Blank)
    }

    fn settle_unloaded(&mut self, idx: usize, recovered: Recovered) {
        let tab = &mut self.tabs[idx];
        match recovered {
            Recovered::CurrentBackup => {}
            Recovered::SourceFile => {
                if tab.is_dirty() {
                    // History was built on pixels that are gone.
                    tab.history.clear();
                    log::error!("load: unsaved changes of {} lost, reloaded its source", tab.id);
                    let name = tab.name.clone();
                    self.notify(format!("Unsaved changes to {} could not be recovered", name), true);
                }
            }
            Recovered::StaleBackup => {
                tab.history.clear();
                tab.backup_state = Some(tab.history.current_state());
            }
            Recovered::Blank => tab.history.clear(),
        }
    }

    // ========================================================================
    // CLOSING
    // ========================================================================

    /// Remove a tab. Dirty tabs with a source file keep their backup so the session
    /// can restore them; new tabs and clean tabs have their cache files deleted.
    pub fn close_tab(&mut self, id: TabId) -> Result<()> {
        let idx = self.index_of(id)?;
        let mut tab = self.tabs.remove(idx);
        let state = tab.history.current_state();

        if tab.is_dirty() && !tab.is_new {
            let path = self.cache.backup_path(id);
            let mut retained = RetainedTab::new(session_entry(&tab));
            // An older write in flight would land over a current backup.
            let older_in_flight = tab.backup_in_flight.is_some_and(|s| s != state);
            if tab.backup_state != Some(state) || older_in_flight {
                retained.entry.backup_path = Some(path.clone());
                let source = tab.snapshot_source().or_else(|| tab.document.take().map(Arc::new));
                match (tab.backup_in_flight, source) {
                    (Some(in_flight), source) if in_flight == state => {
                        retained.final_state = Some(state);
                        retained.buffer = source;
                    }
                    (Some(_), Some(doc)) => {
                        retained.final_state = Some(state);
                        retained.buffer = Some(doc);
                        retained.write_deferred = true;
                    }
                    (None, Some(doc)) => {
                        retained.final_state = Some(state);
                        retained.buffer = Some(doc.clone());
                        self.spawn_backup(id, state, doc, path);
                    }
                    (_, None) => log::warn!("close: {} has no buffer for a final backup", id),
                }
            }
            log::info!("close: {} retained with backup", id);
            self.retained.push(retained);
        } else {
            if let Some(path) = tab.backup_path.take() {
                self.cache.remove_disposable(&path);
            }
            // A write still in flight lands after this; it is removed on arrival.
            self.cache.remove_disposable(&self.cache.backup_path(id));
            log::info!("close: {} discarded", id);
        }

        if self.active == Some(id) {
            self.active = None;
            let neighbour = self.tabs.get(idx).or_else(|| idx.checked_sub(1).and_then(|i| self.tabs.get(i)));
            if let Some(next) = neighbour.map(|t| t.id) {
                self.switch_to_tab(next)?;
                return Ok(());
            }
        }
        self.queue_session_write();
        Ok(())
    }

    /// Bring a closed dirty tab back with its unsaved pixels. The tab is dirty and
    /// its undo history starts empty.
    pub fn reopen_retained(&mut self, id: TabId) -> Result<TabId> {
        let pos = self
            .retained
            .iter()
            .position(|r| r.entry.id == id)
            .ok_or(EngineError::UnknownTab(id))?;
        let retained = self.retained.remove(pos);
        let mut tab = self.tab_from_entry(&retained.entry);
        tab.history.detach_saved_state();
        match retained.buffer {
            Some(doc) => {
                // The backup file may still be behind the held pixels.
                tab.backup_state = None;
                tab.install_document(Arc::try_unwrap(doc).unwrap_or_else(|shared| (*shared).clone()));
            }
            None => {
                if tab.backup_path.is_none() {
                    log::warn!("reopen: {} has no backup, falling back to its source", id);
                }
            }
        }
        // The outstanding write reports as stale and is redone for the new state.
        tab.backup_in_flight = retained.final_state;
        if let Some(path) = tab.file_path.clone() {
            self.remember_path(path);
        }
        log::info!("reopen: {} from retained backup", id);
        self.push_and_activate(tab)
    }

    /// Forget a closed dirty tab and delete its backup.
    pub fn discard_retained(&mut self, id: TabId) -> Result<()> {
        let pos = self
            .retained
            .iter()
            .position(|r| r.entry.id == id)
            .ok_or(EngineError::UnknownTab(id))?;
        let retained = self.retained.remove(pos);
        if let Some(path) = &retained.entry.backup_path {
            self.cache.remove_disposable(path);
        }
        log::info!("close: retained {} discarded", id);
        self.queue_session_write();
        Ok(())
    }

    // ========================================================================
    // SAVING
    // ========================================================================

    pub fn save_tab(&mut self, id: TabId) -> Result<()> {
        let idx = self.index_of(id)?;
        let path = self.tabs[idx].file_path.clone().ok_or(EngineError::NoPath(id))?;
        self.save_tab_as(id, &path)
    }

    /// Encode the tab to `path` (format from the extension). On success the tab is
    /// clean and its backup is deleted; on failure nothing changes.
    pub fn save_tab_as(&mut self, id: TabId, path: &Path) -> Result<()> {
        let idx = self.index_of(id)?;
        let (result, recovered) = {
            let tab = &self.tabs[idx];
            if let Some(doc) = tab.document() {
                (io::save_document(doc, path), None)
            } else if let Some(doc) = tab.snapshot_source() {
                (io::save_document(&doc, path), None)
            } else {
                let (doc, recovered) = self.read_unloaded(idx);
                (io::save_document(&doc, path), Some(recovered))
            }
        };

        if let Err(e) = result {
            log::error!("save: {} to {} failed: {}", id, path.display(), e);
            let name = self.tabs[idx].name.clone();
            self.notify(format!("Could not save {}: {}", name, e), true);
            return Err(e);
        }
        if let Some(recovered) = recovered {
            self.settle_unloaded(idx, recovered);
        }

        let tab = &mut self.tabs[idx];
        tab.file_path = Some(path.to_path_buf());
        tab.update_name_from_path();
        tab.is_new = false;
        tab.mark_saved();
        tab.parked = None;
        tab.backup_state = None;
        if let Some(backup) = tab.backup_path.take() {
            self.cache.remove_disposable(&backup);
        }
        log::info!("save: {} → {}", id, path.display());
        self.remember_path(path.to_path_buf());
        self.queue_session_write();
        Ok(())
    }

    /// Back up every tab with unsaved work and rewrite the session file.
    pub fn save_all(&mut self) {
        for idx in 0..self.tabs.len() {
            self.request_tab_backup(idx);
        }
        self.queue_session_write();
    }

    /// Idle timer: back up the active tab once `idle_backup_seconds` have passed.
    /// Returns true when a backup was started.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.pump_events();
        let interval = self.settings.idle_backup_seconds;
        if interval == 0 || now.saturating_duration_since(self.last_idle_backup) < Duration::from_secs(interval) {
            return false;
        }
        self.last_idle_backup = now;
        let Some(idx) = self.active.and_then(|id| self.index_of(id).ok()) else {
            return false;
        };
        let started = self.request_tab_backup(idx);
        if started {
            self.queue_session_write();
        }
        started
    }

    // ========================================================================
    // EXPORT + EDITING
    // ========================================================================

    /// Write the active buffer into the clipboard or drag cache folder.
    pub fn export_active(&mut self, target: ExportTarget) -> Result<PathBuf> {
        let tab = self
            .active_tab()
            .ok_or_else(|| EngineError::invalid_state("no active tab"))?;
        let doc = tab
            .document()
            .ok_or_else(|| EngineError::invalid_state("active tab is not loaded"))?;
        // Sanitize project name into a safe filename component
        let safe_name: String = tab
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let path = self
            .cache
            .export_dir(target)
            .join(format!("{}_{}.png", safe_name, stamp));
        io::write_png(doc, &path)?;
        Ok(path)
    }

    pub fn purge_ephemeral(&self) {
        self.cache.purge_ephemeral();
    }

    pub fn undo(&mut self) -> Result<String> {
        self.active_tab_mut()
            .ok_or_else(|| EngineError::invalid_state("no active tab"))?
            .undo()
    }

    pub fn redo(&mut self) -> Result<String> {
        self.active_tab_mut()
            .ok_or_else(|| EngineError::invalid_state("no active tab"))?
            .redo()
    }

    /// Clear every tab's undo and redo stacks.
    pub fn reset(&mut self) {
        for tab in &mut self.tabs {
            tab.history.clear();
        }
    }

    // ========================================================================
    // BACKUPS
    // ========================================================================

    /// At most one backup runs per tab; a newer state is picked up when the
    /// in-flight write reports back.
    fn request_tab_backup(&mut self, idx: usize) -> bool {
        let tab = &mut self.tabs[idx];
        let state = tab.history.current_state();
        if tab.backup_state == Some(state) || !wants_backup(tab) {
            // Backup or source file already reproduces these pixels.
            tab.parked = None;
            return false;
        }
        if tab.backup_in_flight.is_some() {
            return false;
        }
        let source = match tab.snapshot_source() {
            Some(doc) => doc,
            None => match tab.document() {
                Some(doc) => Arc::new(doc.clone()),
                None => return false,
            },
        };
        tab.backup_in_flight = Some(state);
        let id = tab.id;
        let path = self.cache.backup_path(id);
        self.spawn_backup(id, state, source, path);
        true
    }

    fn spawn_backup(&mut self, tab: TabId, state: u64, document: Arc<RasterDocument>, path: PathBuf) {
        self.pending_jobs += 1;
        self.persistence.request_backup(tab, state, document, path);
    }

    fn queue_session_write(&mut self) {
        self.pending_jobs += 1;
        let file = self.session_file();
        self.persistence.write_session(file);
    }

    fn on_backup_written(&mut self, id: TabId, state: u64, path: PathBuf, at: chrono::DateTime<Utc>) {
        if let Ok(idx) = self.index_of(id) {
            let tab = &mut self.tabs[idx];
            tab.backup_in_flight = None;
            if state == tab.history.current_state() && wants_backup(tab) {
                if let Some(old) = tab.backup_path.replace(path.clone())
                    && old != path
                {
                    self.cache.remove_disposable(&old);
                }
                tab.backup_state = Some(state);
                tab.last_backup_time = Some(at);
                tab.release_parked(state);
                self.queue_session_write();
            } else {
                log::debug!("backup: {} state {} is stale", id, state);
                if tab.backup_path.as_ref() != Some(&path) {
                    self.cache.remove_disposable(&path);
                }
                self.request_tab_backup(idx);
            }
            return;
        }

        if let Some(pos) = self.retained.iter().position(|r| r.entry.id == id) {
            let retained = &mut self.retained[pos];
            let Some(final_state) = retained.final_state else {
                // Superseded by a batch result while the write was in flight.
                if retained.entry.backup_path.as_ref() != Some(&path) {
                    self.cache.remove_disposable(&path);
                }
                return;
            };
            retained.entry.backup_path = Some(path.clone());
            if final_state == state {
                retained.final_state = None;
                retained.buffer = None;
            } else if retained.write_deferred
                && let Some(doc) = retained.buffer.clone()
            {
                retained.write_deferred = false;
                self.spawn_backup(id, final_state, doc, path);
                return;
            }
            self.queue_session_write();
            return;
        }

        // Tab was discarded while the write was in flight.
        self.cache.remove_disposable(&path);
    }

    fn on_backup_failed(&mut self, id: TabId, state: u64, error: String) {
        if let Ok(idx) = self.index_of(id) {
            let tab = &mut self.tabs[idx];
            tab.backup_in_flight = None;
            let name = tab.name.clone();
            // The parked buffer stays: it is the only copy of these pixels.
            self.notify(format!("Backup of {} failed: {}", name, error), true);
            return;
        }
        if let Some(pos) = self.retained.iter().position(|r| r.entry.id == id) {
            let retained = &mut self.retained[pos];
            if retained.write_deferred
                && let (Some(final_state), Some(doc)) = (retained.final_state, retained.buffer.clone())
            {
                retained.write_deferred = false;
                let path = self.cache.backup_path(id);
                self.spawn_backup(id, final_state, doc, path);
                return;
            }
            if retained.final_state.take().is_none() {
                return;
            }
            // The held buffer stays: reopening still recovers it.
            let name = retained.entry.name.clone();
            log::error!("close: final backup of {} at state {} failed: {}", id, state, error);
            self.notify(format!("Unsaved changes to {} could not be backed up: {}", name, error), true);
        }
    }

    // ========================================================================
    // EVENT PUMP
    // ========================================================================

    /// Apply every queued background result. Returns how many were applied.
    pub fn pump_events(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.events.try_next() {
            self.apply_event(event);
            applied += 1;
        }
        applied
    }

    /// Block until every outstanding background job has reported back, or the
    /// timeout elapses. Returns true when nothing is pending.
    pub fn wait_for_background(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump_events();
            if self.pending_jobs == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("workspace: {} background job(s) still pending", self.pending_jobs);
                return false;
            }
            if let Some(event) = self.events.next_timeout(deadline - now) {
                self.apply_event(event);
            }
        }
    }

    /// Drain background work and write the session file synchronously.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.save_all();
        self.wait_for_background(timeout);
        let file = self.session_file();
        self.persistence.write_session_now(&file)
    }

    fn apply_event(&mut self, event: WorkspaceEvent) {
        match event {
            WorkspaceEvent::BackupWritten { tab, state, path, at } => {
                self.finish_job();
                self.on_backup_written(tab, state, path, at);
            }
            WorkspaceEvent::BackupFailed { tab, state, error } => {
                self.finish_job();
                self.on_backup_failed(tab, state, error);
            }
            WorkspaceEvent::SessionWritten { generation, path } => {
                self.finish_job();
                log::debug!("session: generation {} at {}", generation, path.display());
            }
            WorkspaceEvent::SessionWriteFailed { generation, error } => {
                self.finish_job();
                log::error!("session: generation {} failed: {}", generation, error);
                self.notify(format!("Session could not be saved: {}", error), true);
            }
            WorkspaceEvent::BatchUnitFinished {
                batch,
                tab,
                base_state,
                outcome,
            } => self.on_unit_finished(batch, tab, base_state, outcome),
            WorkspaceEvent::BatchFinished { batch } => {
                self.finish_job();
                self.on_batch_finished(batch);
            }
        }
    }

    fn finish_job(&mut self) {
        self.pending_jobs = self.pending_jobs.saturating_sub(1);
    }

    // ========================================================================
    // BATCH
    // ========================================================================

    /// Run `operation` over every open tab except the active one plus every
    /// retained tab with a backup. One batch at a time.
    pub fn run_batch(&mut self, operation: BatchOperation) -> Result<u64> {
        if self.batch.is_some() {
            return Err(EngineError::invalid_state("a batch is already running"));
        }
        self.cache.ensure()?;
        let op_name = operation.name();
        let mut units = Vec::new();

        for idx in 0..self.tabs.len() {
            if Some(self.tabs[idx].id) == self.active {
                continue;
            }
            let source = self.unit_source(idx);
            let id = self.tabs[idx].id;
            units.push(BatchUnit {
                tab: id,
                base_state: Some(self.tabs[idx].history.current_state()),
                source,
                output: self.cache.batch_output_path(id, op_name),
            });
        }
        for retained in &self.retained {
            let backup = retained.entry.backup_path.as_ref().filter(|p| p.exists());
            let source = match (&retained.buffer, backup) {
                (Some(doc), _) => UnitSource::Memory(doc.clone()),
                (None, Some(backup)) => UnitSource::File(backup.clone()),
                (None, None) => continue,
            };
            let id = retained.entry.id;
            units.push(BatchUnit {
                tab: id,
                base_state: None,
                source,
                output: self.cache.batch_output_path(id, op_name),
            });
        }

        self.next_batch_id += 1;
        let id = self.next_batch_id;
        let total = units.len();
        let runner = BatchJobRunner::new(
            self.dispatcher.clone(),
            operation.parallelism(&self.settings),
            self.settings.thumbnail_max_dim,
        );
        let handle = runner.start(id, operation, units)?;
        self.pending_jobs += 1;
        self.batch = Some(RunningBatch {
            handle,
            total,
            succeeded: 0,
            failed: Vec::new(),
            skipped: Vec::new(),
        });
        Ok(id)
    }

    /// Pixels for one batch unit: held buffer, then backup, then source file. A tab
    /// with neither file nor backup gets a blank placeholder written first.
    fn unit_source(&mut self, idx: usize) -> UnitSource {
        let tab = &mut self.tabs[idx];
        if let Some(doc) = tab.snapshot_source() {
            return UnitSource::Memory(doc);
        }
        if let Some(doc) = tab.document() {
            return UnitSource::Memory(Arc::new(doc.clone()));
        }
        if let Some(backup) = tab.backup_path.as_ref().filter(|p| p.exists()) {
            return UnitSource::File(backup.clone());
        }
        if let Some(file) = &tab.file_path {
            return UnitSource::File(file.clone());
        }
        let placeholder = self.cache.backup_path(tab.id);
        let (w, h) = match tab.last_known_size {
            (0, _) | (_, 0) => DEFAULT_CANVAS_SIZE,
            size => size,
        };
        match io::write_png(&RasterDocument::new(w, h), &placeholder) {
            Ok(()) => {
                tab.backup_path = Some(placeholder.clone());
                tab.backup_state = Some(tab.history.current_state());
            }
            Err(e) => log::error!("batch: placeholder for {} failed: {}", tab.id, e),
        }
        UnitSource::File(placeholder)
    }

    pub fn batch_progress(&self) -> Option<Arc<BatchProgress>> {
        self.batch.as_ref().map(|b| b.handle.progress().clone())
    }

    pub fn is_batch_running(&self) -> bool {
        self.batch.is_some()
    }

    pub fn take_batch_report(&mut self) -> Option<BatchReport> {
        self.last_report.take()
    }

    fn on_unit_finished(
        &mut self,
        batch: u64,
        id: TabId,
        base_state: Option<u64>,
        outcome: std::result::Result<UnitOutput, String>,
    ) {
        let Some(running) = self.batch.as_mut().filter(|b| b.handle.id == batch) else {
            log::warn!("batch: result for unknown batch {}", batch);
            if let Ok(output) = outcome {
                self.cache.remove_disposable(&output.backup_path);
            }
            return;
        };
        let label = format!("Batch {}", running.handle.operation);
        let output = match outcome {
            Ok(output) => output,
            Err(error) => {
                running.failed.push((id, error));
                return;
            }
        };

        let applied = self.apply_unit_output(id, base_state, output, label);
        if let Some(running) = self.batch.as_mut() {
            if applied {
                running.succeeded += 1;
            } else {
                running.skipped.push(id);
            }
        }
    }

    /// Install one unit result. Returns false when the tab moved on since the unit
    /// was dispatched; the result is then deleted and the tab left as it is.
    fn apply_unit_output(&mut self, id: TabId, base_state: Option<u64>, output: UnitOutput, label: String) -> bool {
        if let Ok(idx) = self.index_of(id) {
            let tab = &mut self.tabs[idx];
            if base_state != Some(tab.history.current_state()) || tab.history.is_stroke_active() {
                log::warn!("batch: {} was edited while its unit ran, result dropped", id);
                self.cache.remove_disposable(&output.backup_path);
                return false;
            }

            if tab.is_resident() {
                // Opened mid-run with nothing changed: apply as an undoable edit.
                let applied = io::load_document(&output.backup_path)
                    .and_then(|doc| tab.replace_document(doc, label));
                if let Err(e) = applied {
                    log::error!("batch: could not apply result for {}: {}", id, e);
                    self.cache.remove_disposable(&output.backup_path);
                    return false;
                }
            } else {
                tab.history.reset_baseline();
                tab.history.detach_saved_state();
                tab.parked = None;
            }
            if let Some(old) = tab.backup_path.replace(output.backup_path.clone())
                && old != output.backup_path
            {
                self.cache.remove_disposable(&old);
            }
            tab.backup_state = Some(tab.history.current_state());
            tab.thumbnail = Some(output.thumbnail);
            tab.last_known_size = output.size;
            tab.last_backup_time = Some(Utc::now());
            return true;
        }

        if let Some(retained) = self.retained.iter_mut().find(|r| r.entry.id == id) {
            if let Some(old) = retained.entry.backup_path.replace(output.backup_path.clone())
                && old != output.backup_path
            {
                self.cache.remove_disposable(&old);
            }
            // The result supersedes any final write still in flight.
            retained.final_state = None;
            retained.buffer = None;
            retained.write_deferred = false;
            retained.entry.is_dirty = true;
            retained.entry.width = output.size.0;
            retained.entry.height = output.size.1;
            return true;
        }

        // Tab was discarded during the batch.
        self.cache.remove_disposable(&output.backup_path);
        true
    }

    fn on_batch_finished(&mut self, batch: u64) {
        let Some(mut running) = self.batch.take_if(|b| b.handle.id == batch) else {
            return;
        };
        running.handle.join();
        let report = BatchReport {
            id: batch,
            operation: running.handle.operation,
            total: running.total,
            succeeded: running.succeeded,
            failed: running.failed,
            skipped: running.skipped,
        };
        log::info!(
            "batch {}: {} done, {}/{} succeeded",
            batch,
            report.operation,
            report.succeeded,
            report.total
        );
        let mut message = if report.failed.is_empty() {
            format!("{} applied to {} image(s)", report.operation, report.succeeded)
        } else {
            format!(
                "{} applied to {} of {} image(s); {} failed",
                report.operation,
                report.succeeded,
                report.total,
                report.failed.len()
            )
        };
        if !report.skipped.is_empty() {
            message.push_str(&format!("; {} skipped (edited meanwhile)", report.skipped.len()));
        }
        let is_error = !report.failed.is_empty();
        self.notify(message, is_error);
        self.last_report = Some(report);
        self.queue_session_write();
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    pub fn session_file(&self) -> SessionFile {
        SessionFile {
            version: SESSION_VERSION,
            tabs: self.tabs.iter().map(session_entry).collect(),
            retained: self.retained.iter().map(|r| r.entry.clone()).collect(),
            active_tab: self.active,
            known_paths: self.known_paths.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild tabs from a session file. Buffers load lazily, except the active
    /// tab's. Only valid on an empty workspace.
    pub fn restore_session(&mut self, file: SessionFile) -> Result<()> {
        if !self.tabs.is_empty() {
            return Err(EngineError::invalid_state("restore needs an empty workspace"));
        }
        for entry in &file.tabs {
            let mut tab = self.tab_from_entry(entry);
            if entry.is_dirty {
                tab.history.detach_saved_state();
            }
            if let Some(n) = entry.name.strip_prefix("Untitled-").and_then(|n| n.parse::<usize>().ok()) {
                self.untitled_counter = self.untitled_counter.max(n);
            }
            self.tabs.push(tab);
        }
        self.retained = file
            .retained
            .into_iter()
            .filter(|e| e.backup_path.as_ref().is_some_and(|p| p.exists()))
            .map(RetainedTab::new)
            .collect();
        self.known_paths = file.known_paths;
        log::info!(
            "session: restored {} tab(s), {} retained",
            self.tabs.len(),
            self.retained.len()
        );

        let active = file
            .active_tab
            .filter(|id| self.tab(*id).is_some())
            .or_else(|| self.tabs.first().map(|t| t.id));
        if let Some(id) = active {
            self.switch_to_tab(id)?;
        }
        Ok(())
    }

    /// Unloaded tab described by a session entry. A recorded backup is taken to
    /// reflect the tab's starting state.
    fn tab_from_entry(&self, entry: &SessionEntry) -> TabSession {
        let mut tab = TabSession::restored(entry.id, entry.name.clone(), self.settings.history_limits());
        tab.file_path = entry.original_path.clone();
        tab.backup_path = entry.backup_path.clone();
        tab.is_new = entry.is_new;
        tab.last_known_size = (entry.width, entry.height);
        if tab.backup_path.is_some() {
            tab.backup_state = Some(tab.history.current_state());
        }
        tab
    }
}

fn wants_backup(tab: &TabSession) -> bool {
    tab.is_dirty() || tab.is_new
}

fn session_entry(tab: &TabSession) -> SessionEntry {
    SessionEntry {
        id: tab.id,
        original_path: tab.file_path.clone(),
        backup_path: tab.backup_path.clone(),
        is_dirty: tab.is_dirty(),
        is_new: tab.is_new,
        name: tab.name.clone(),
        width: tab.last_known_size.0,
        height: tab.last_known_size.1,
    }
}
