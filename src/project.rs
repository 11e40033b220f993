use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{PixelRect, RasterDocument};
use crate::components::history::{HistoryLimits, UndoEngine};
use crate::error::{EngineError, Result};

/// Stable identity of a logical document, also used for its cache file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TabLifecycle {
    /// Never saved, no source path.
    New,
    /// Buffer differs from the file on disk.
    Dirty,
    /// Buffer matches the file on disk.
    Clean,
}

/// A buffer handed to an in-flight background backup.
#[derive(Debug)]
pub(crate) struct ParkedDocument {
    pub(crate) document: Arc<RasterDocument>,
    /// History state the parked buffer reflects.
    pub(crate) state: u64,
}

/// Single open document.
#[derive(Debug)]
pub struct TabSession {
    pub id: TabId,
    /// `None` for unsaved/untitled files.
    pub file_path: Option<PathBuf>,
    /// Latest cache snapshot of the in-memory buffer.
    pub backup_path: Option<PathBuf>,
    pub is_new: bool,
    pub is_loading: bool,
    pub thumbnail: Option<RasterDocument>,
    pub last_backup_time: Option<DateTime<Utc>>,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
    pub history: UndoEngine,
    /// Dimensions of the buffer the last time it was resident.
    pub last_known_size: (u32, u32),
    pub(crate) document: Option<RasterDocument>,
    pub(crate) parked: Option<ParkedDocument>,
    /// State id of the backup currently being written, if any.
    pub(crate) backup_in_flight: Option<u64>,
    /// State id the file at `backup_path` reflects.
    pub(crate) backup_state: Option<u64>,
}

impl TabSession {
    fn blank(name: String, limits: HistoryLimits) -> Self {
        Self {
            id: TabId::new(),
            file_path: None,
            backup_path: None,
            is_new: true,
            is_loading: false,
            thumbnail: None,
            last_backup_time: None,
            name,
            history: UndoEngine::new(limits),
            last_known_size: (0, 0),
            document: None,
            parked: None,
            backup_in_flight: None,
            backup_state: None,
        }
    }

    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32, limits: HistoryLimits) -> Self {
        let mut tab = Self::blank(format!("Untitled-{}", untitled_counter), limits);
        tab.install_document(RasterDocument::new(width, height));
        tab
    }

    /// Untitled tab holding pasted pixels; dirty from the start.
    pub fn from_paste(untitled_counter: usize, document: RasterDocument, limits: HistoryLimits) -> Self {
        let mut tab = Self::blank(format!("Untitled-{}", untitled_counter), limits);
        tab.install_document(document);
        tab.history.detach_saved_state();
        tab
    }

    pub fn from_file(path: PathBuf, document: RasterDocument, limits: HistoryLimits) -> Self {
        let mut tab = Self::blank(name_from_path(&path), limits);
        tab.file_path = Some(path);
        tab.is_new = false;
        tab.install_document(document);
        tab
    }

    /// Tab rebuilt from session metadata; its buffer loads lazily.
    pub fn restored(id: TabId, name: String, limits: HistoryLimits) -> Self {
        let mut tab = Self::blank(name, limits);
        tab.id = id;
        tab
    }

    // -- state ---------------------------------------------------------------

    /// Derived from the history save point so undoing back to the saved state
    /// makes the tab clean again.
    pub fn is_dirty(&self) -> bool {
        !self.history.is_at_saved_state()
    }

    pub fn lifecycle(&self) -> TabLifecycle {
        if self.is_new && self.file_path.is_none() {
            TabLifecycle::New
        } else if self.is_dirty() {
            TabLifecycle::Dirty
        } else {
            TabLifecycle::Clean
        }
    }

    pub fn mark_saved(&mut self) {
        self.history.mark_saved();
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty() {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.file_path {
            self.name = name_from_path(path);
        }
    }

    /// The resident buffer, if it is loaded.
    pub fn document(&self) -> Option<&RasterDocument> {
        self.document.as_ref()
    }

    /// The parked buffer, shared with whichever background job reads it.
    pub(crate) fn snapshot_source(&self) -> Option<Arc<RasterDocument>> {
        self.parked.as_ref().map(|p| p.document.clone())
    }

    pub fn is_resident(&self) -> bool {
        self.document.is_some()
    }

    /// True while the previous buffer is still held for a background backup.
    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    pub(crate) fn install_document(&mut self, document: RasterDocument) {
        self.last_known_size = document.size();
        self.document = Some(document);
        self.is_loading = false;
    }

    /// Move the resident buffer out so a background backup can read it while the
    /// tab is inactive. Returns `None` when nothing was resident.
    pub(crate) fn park(&mut self) -> Option<Arc<RasterDocument>> {
        let document = Arc::new(self.document.take()?);
        self.parked = Some(ParkedDocument {
            document: document.clone(),
            state: self.history.current_state(),
        });
        Some(document)
    }

    /// Make a parked buffer resident again. Cheap when the backup job already
    /// released its reference.
    pub(crate) fn reclaim(&mut self) -> bool {
        let Some(parked) = self.parked.take() else { return false };
        let document = Arc::try_unwrap(parked.document).unwrap_or_else(|shared| (*shared).clone());
        self.install_document(document);
        true
    }

    /// Drop the parked buffer once the backup of exactly that state is on disk.
    pub(crate) fn release_parked(&mut self, state: u64) -> bool {
        if self.parked_state() == Some(state) {
            self.parked = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn parked_state(&self) -> Option<u64> {
        self.parked.as_ref().map(|p| p.state)
    }

    // -- editing facade ------------------------------------------------------

    fn resident_mut(&mut self) -> Result<&mut RasterDocument> {
        self.document
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state(format!("tab {} is not loaded", self.id)))
    }

    fn resident(&self) -> Result<&RasterDocument> {
        self.document
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state(format!("tab {} is not loaded", self.id)))
    }

    pub fn begin_stroke(&mut self) -> Result<()> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        self.history.begin_stroke(document)
    }

    pub fn add_dirty_rect(&mut self, rect: PixelRect) -> Result<()> {
        self.history.add_dirty_rect(rect)
    }

    /// Mutable buffer for tools. Writes must be bracketed by a stroke or preceded
    /// by one of the snapshot pushes.
    pub fn document_mut(&mut self) -> Result<&mut RasterDocument> {
        self.resident_mut()
    }

    pub fn commit_stroke(&mut self, label: impl Into<String>) -> Result<bool> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        self.history.commit_stroke(document, label)
    }

    pub fn cancel_stroke(&mut self) -> Result<()> {
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        self.history.cancel_stroke(document)
    }

    pub fn push_full_image_undo(&mut self, label: impl Into<String>) -> Result<()> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        self.history.push_full_image_undo(document, label)
    }

    /// Wholesale buffer replace (AI output, full-canvas filter) as one undo entry.
    /// Differing dimensions are recorded as a transform.
    pub fn replace_document(&mut self, replacement: RasterDocument, label: impl Into<String>) -> Result<()> {
        let same_size = self.resident()?.size() == replacement.size();
        if same_size {
            self.push_full_image_undo(label)?;
            let document = self.resident_mut()?;
            // The snapshot already holds the old pixels.
            let _old = document.replace(replacement);
        } else {
            self.apply_transform(label, move |_| replacement)?;
        }
        Ok(())
    }

    /// Run a dimension-changing operation and record it as a TransformAction.
    pub fn apply_transform<F>(&mut self, label: impl Into<String>, transform: F) -> Result<()>
    where
        F: FnOnce(&RasterDocument) -> RasterDocument,
    {
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        let before_rect = document.bounds();
        let before_pixels = document.to_packed();
        let result = transform(document);
        let after_rect = result.bounds();
        let after_pixels = result.to_packed();
        self.history
            .push_transform_action(before_rect, before_pixels, after_rect, after_pixels, label)?;
        let _old = document.replace(result);
        self.last_known_size = (after_rect.width, after_rect.height);
        Ok(())
    }

    pub fn push_explicit_image_undo(&mut self, original: RasterDocument, label: impl Into<String>) -> Result<()> {
        self.resident()?;
        self.history.push_explicit_image_undo(original, label)
    }

    pub fn undo(&mut self) -> Result<String> {
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        let label = self.history.undo(document)?;
        self.last_known_size = document.size();
        Ok(label)
    }

    pub fn redo(&mut self) -> Result<String> {
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state("tab is not loaded"))?;
        let label = self.history.redo(document)?;
        self.last_known_size = document.size();
        Ok(label)
    }
}

pub fn name_from_path(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
