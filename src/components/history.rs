use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::canvas::{BufferPool, PixelRect, RasterDocument};
use crate::error::{EngineError, Result, StackKind};

// ============================================================================
// UNDO RECORDS
// ============================================================================

/// One reversible raster mutation.
///
/// Every record describes how to get *back* to an earlier state. Reverting it
/// yields the record that undoes the revert, which is what lands on the opposite
/// stack, so undo and redo share one code path.
#[derive(Debug)]
pub enum UndoRecord {
    /// Patch-based diff over the union of everything a stroke touched.
    StrokeDelta {
        rect: PixelRect,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Whole-buffer copy taken right before a wholesale replace.
    FullImageSnapshot { buffer: RasterDocument },
    /// Dimension-changing operation (crop, resize, upscale).
    TransformAction {
        before_rect: PixelRect,
        before_pixels: Vec<u8>,
        after_rect: PixelRect,
        after_pixels: Vec<u8>,
    },
    /// Caller-cloned "before" buffer (live preview dialogs).
    ExplicitSnapshot { buffer: RasterDocument },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    StrokeDelta,
    FullImageSnapshot,
    TransformAction,
    ExplicitSnapshot,
}

impl UndoRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            UndoRecord::StrokeDelta { .. } => RecordKind::StrokeDelta,
            UndoRecord::FullImageSnapshot { .. } => RecordKind::FullImageSnapshot,
            UndoRecord::TransformAction { .. } => RecordKind::TransformAction,
            UndoRecord::ExplicitSnapshot { .. } => RecordKind::ExplicitSnapshot,
        }
    }

    pub fn memory_size(&self) -> usize {
        match self {
            UndoRecord::StrokeDelta { before, after, .. } => before.len() + after.len(),
            UndoRecord::FullImageSnapshot { buffer } | UndoRecord::ExplicitSnapshot { buffer } => {
                buffer.byte_len()
            }
            UndoRecord::TransformAction {
                before_pixels,
                after_pixels,
                ..
            } => before_pixels.len() + after_pixels.len(),
        }
    }

    /// Reject a revert that could not be applied to `doc` without partial writes.
    fn check(&self, doc: &RasterDocument) -> Result<()> {
        match self {
            UndoRecord::StrokeDelta { rect, before, .. } => {
                if rect.clamp_to(doc.width(), doc.height()) != *rect || before.len() != rect.byte_len() {
                    return Err(EngineError::invalid_state(format!(
                        "stroke patch {:?} no longer fits the {}x{} canvas",
                        rect,
                        doc.width(),
                        doc.height()
                    )));
                }
                Ok(())
            }
            UndoRecord::TransformAction {
                before_rect,
                before_pixels,
                ..
            } => {
                if before_pixels.len() != before_rect.byte_len() {
                    return Err(EngineError::invalid_state("transform pixels do not cover their rect"));
                }
                Ok(())
            }
            UndoRecord::FullImageSnapshot { .. } | UndoRecord::ExplicitSnapshot { .. } => Ok(()),
        }
    }

    /// Restore the state this record captured and return its inverse. Only called
    /// after `check` accepted the record for `doc`, so it cannot fail halfway.
    fn revert(self, doc: &mut RasterDocument, pool: &mut BufferPool) -> UndoRecord {
        match self {
            UndoRecord::StrokeDelta { rect, before, after } => {
                doc.blit_rect(rect, &before);
                UndoRecord::StrokeDelta {
                    rect,
                    before: after,
                    after: before,
                }
            }
            UndoRecord::FullImageSnapshot { buffer } => {
                let live = doc.replace(buffer);
                UndoRecord::FullImageSnapshot { buffer: live }
            }
            UndoRecord::ExplicitSnapshot { buffer } => {
                let live = doc.replace(buffer);
                UndoRecord::ExplicitSnapshot { buffer: live }
            }
            UndoRecord::TransformAction {
                before_rect,
                before_pixels,
                after_rect: _,
                after_pixels,
            } => {
                let restored_copy = pool.take_copy(&before_pixels);
                let restored = RasterDocument::packed_unchecked(before_rect.width, before_rect.height, before_pixels);
                let live = doc.replace(restored);
                let live_rect = PixelRect::full(live.width(), live.height());
                pool.release(after_pixels);
                UndoRecord::TransformAction {
                    before_rect: live_rect,
                    before_pixels: live.into_packed(),
                    after_rect: before_rect,
                    after_pixels: restored_copy,
                }
            }
        }
    }

    fn recycle(self, pool: &mut BufferPool) {
        match self {
            UndoRecord::StrokeDelta { before, after, .. } => {
                pool.release(before);
                pool.release(after);
            }
            UndoRecord::FullImageSnapshot { buffer } | UndoRecord::ExplicitSnapshot { buffer } => {
                pool.release(buffer.into_bytes());
            }
            UndoRecord::TransformAction {
                before_pixels,
                after_pixels,
                ..
            } => {
                pool.release(before_pixels);
                pool.release(after_pixels);
            }
        }
    }
}

/// A history stack entry. Immutable once pushed.
#[derive(Debug)]
struct HistoryEntry {
    label: String,
    record: UndoRecord,
    pinned: bool,
    /// Document state id before the recorded change (what reverting restores).
    state_before: u64,
    /// Document state id after the recorded change.
    state_after: u64,
}

impl HistoryEntry {
    fn memory_size(&self) -> usize {
        self.record.memory_size() + self.label.len()
    }
}

// ============================================================================
// LIMITS
// ============================================================================

/// Which entries budget eviction may drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionScope {
    /// Every unpinned entry.
    #[default]
    All,
    /// Only stroke deltas; snapshot and transform entries behave as pinned.
    StrokesOnly,
}

impl EvictionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionScope::All => "all",
            EvictionScope::StrokesOnly => "strokes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(EvictionScope::All),
            "strokes" | "strokes_only" => Some(EvictionScope::StrokesOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    /// Upper bound on undo entries, independent of memory.
    pub max_entries: usize,
    /// Combined size of both stacks before old undo entries are dropped.
    pub memory_budget_bytes: usize,
    pub eviction_scope: EvictionScope,
    /// Buffers kept for reuse by the engine's pool.
    pub pool_capacity: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_entries: 50,
            memory_budget_bytes: 100 * 1024 * 1024, // 100 MB default limit
            eviction_scope: EvictionScope::All,
            pool_capacity: 4,
        }
    }
}

// ============================================================================
// UNDO ENGINE
// ============================================================================

struct ActiveStroke {
    baseline: RasterDocument,
    union: PixelRect,
}

/// State ids are unique across every engine in the process, so a background
/// result tagged with a state can never match a different tab's history.
fn next_state_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Undo/redo stacks for one document.
///
/// The engine never owns the document; every mutating call borrows it. Each record
/// push allocates a new state id so the owner can tell whether the live buffer is
/// back at the last saved state.
pub struct UndoEngine {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    active_stroke: Option<ActiveStroke>,
    limits: HistoryLimits,
    /// Running memory total across both stacks.
    total_memory: usize,
    pool: BufferPool,
    current_state: u64,
    saved_state: Option<u64>,
}

impl Default for UndoEngine {
    fn default() -> Self {
        Self::new(HistoryLimits::default())
    }
}

impl std::fmt::Debug for UndoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoEngine")
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("stroke_active", &self.active_stroke.is_some())
            .field("memory", &self.total_memory)
            .field("state", &self.current_state)
            .field("saved_state", &self.saved_state)
            .finish()
    }
}

impl UndoEngine {
    pub fn new(limits: HistoryLimits) -> Self {
        let initial = next_state_id();
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            active_stroke: None,
            limits,
            total_memory: 0,
            pool: BufferPool::new(limits.pool_capacity),
            current_state: initial,
            saved_state: Some(initial),
        }
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: HistoryLimits) {
        self.limits = limits;
        self.enforce_limits();
    }

    // -- strokes -------------------------------------------------------------

    pub fn begin_stroke(&mut self, doc: &RasterDocument) -> Result<()> {
        if self.active_stroke.is_some() {
            return Err(EngineError::invalid_state("begin_stroke while a stroke is already active"));
        }
        let bytes = self.pool.take_copy(doc.as_bytes());
        let baseline = RasterDocument::from_raw(doc.width(), doc.height(), doc.stride(), bytes)?;
        self.active_stroke = Some(ActiveStroke {
            baseline,
            union: PixelRect::EMPTY,
        });
        Ok(())
    }

    pub fn add_dirty_rect(&mut self, rect: PixelRect) -> Result<()> {
        let stroke = self
            .active_stroke
            .as_mut()
            .ok_or_else(|| EngineError::invalid_state("add_dirty_rect outside of a stroke"))?;
        stroke.union = stroke.union.union(&rect);
        Ok(())
    }

    /// Close the active stroke. Returns `false` when the stroke touched nothing and
    /// no entry was pushed.
    pub fn commit_stroke(&mut self, doc: &RasterDocument, label: impl Into<String>) -> Result<bool> {
        let stroke = self
            .active_stroke
            .take()
            .ok_or_else(|| EngineError::invalid_state("commit_stroke without begin_stroke"))?;

        if stroke.baseline.size() != doc.size() {
            self.pool.release(stroke.baseline.into_bytes());
            return Err(EngineError::invalid_state(
                "canvas dimensions changed during a stroke",
            ));
        }

        let rect = stroke.union.clamp_to(doc.width(), doc.height());
        if rect.is_empty() {
            self.pool.release(stroke.baseline.into_bytes());
            return Ok(false);
        }

        let before = stroke.baseline.copy_rect(rect);
        let after = doc.copy_rect(rect);
        self.pool.release(stroke.baseline.into_bytes());
        self.push_record(label.into(), UndoRecord::StrokeDelta { rect, before, after });
        Ok(true)
    }

    /// Abort the active stroke, restoring whatever it had already painted.
    pub fn cancel_stroke(&mut self, doc: &mut RasterDocument) -> Result<()> {
        let stroke = self
            .active_stroke
            .take()
            .ok_or_else(|| EngineError::invalid_state("cancel_stroke without begin_stroke"))?;
        let result = if stroke.baseline.size() == doc.size() {
            let rect = stroke.union.clamp_to(doc.width(), doc.height());
            if rect.is_empty() {
                Ok(())
            } else {
                doc.write_rect(rect, &stroke.baseline.copy_rect(rect))
            }
        } else {
            Err(EngineError::invalid_state("canvas dimensions changed during a stroke"))
        };
        self.pool.release(stroke.baseline.into_bytes());
        result
    }

    pub fn is_stroke_active(&self) -> bool {
        self.active_stroke.is_some()
    }

    // -- whole-buffer records ------------------------------------------------

    /// Snapshot the buffer before the caller overwrites it wholesale.
    pub fn push_full_image_undo(&mut self, doc: &RasterDocument, label: impl Into<String>) -> Result<()> {
        self.ensure_no_stroke("push_full_image_undo")?;
        let bytes = self.pool.take_copy(doc.as_bytes());
        let buffer = RasterDocument::from_raw(doc.width(), doc.height(), doc.stride(), bytes)?;
        self.push_record(label.into(), UndoRecord::FullImageSnapshot { buffer });
        Ok(())
    }

    /// Record a dimension-changing operation from caller-captured before/after data.
    pub fn push_transform_action(
        &mut self,
        before_rect: PixelRect,
        before_pixels: Vec<u8>,
        after_rect: PixelRect,
        after_pixels: Vec<u8>,
        label: impl Into<String>,
    ) -> Result<()> {
        self.ensure_no_stroke("push_transform_action")?;
        if before_pixels.len() != before_rect.byte_len() || after_pixels.len() != after_rect.byte_len() {
            return Err(EngineError::invalid_state(format!(
                "transform pixels ({} / {} bytes) do not match rects {:?} / {:?}",
                before_pixels.len(),
                after_pixels.len(),
                before_rect,
                after_rect
            )));
        }
        self.push_record(
            label.into(),
            UndoRecord::TransformAction {
                before_rect,
                before_pixels,
                after_rect,
                after_pixels,
            },
        );
        Ok(())
    }

    /// Record a buffer the caller cloned before a preview loop started mutating.
    pub fn push_explicit_image_undo(&mut self, buffer: RasterDocument, label: impl Into<String>) -> Result<()> {
        self.ensure_no_stroke("push_explicit_image_undo")?;
        self.push_record(label.into(), UndoRecord::ExplicitSnapshot { buffer });
        Ok(())
    }

    fn ensure_no_stroke(&self, op: &str) -> Result<()> {
        if self.active_stroke.is_some() {
            return Err(EngineError::invalid_state(format!("{} while a stroke is active", op)));
        }
        Ok(())
    }

    fn push_record(&mut self, label: String, record: UndoRecord) {
        // Clear redo stack when a new action is performed
        while let Some(entry) = self.redo_stack.pop_back() {
            self.discard(entry);
        }

        let state_before = self.current_state;
        let state_after = self.allocate_state();
        self.current_state = state_after;

        let entry = HistoryEntry {
            label,
            record,
            pinned: false,
            state_before,
            state_after,
        };
        self.total_memory += entry.memory_size();
        self.undo_stack.push_back(entry);
        self.enforce_limits();
    }

    fn allocate_state(&mut self) -> u64 {
        next_state_id()
    }

    // -- undo / redo ---------------------------------------------------------

    /// Returns the label of the undone entry.
    pub fn undo(&mut self, doc: &mut RasterDocument) -> Result<String> {
        self.step(doc, StackKind::Undo)
    }

    /// Returns the label of the redone entry.
    pub fn redo(&mut self, doc: &mut RasterDocument) -> Result<String> {
        self.step(doc, StackKind::Redo)
    }

    fn step(&mut self, doc: &mut RasterDocument, kind: StackKind) -> Result<String> {
        self.ensure_no_stroke(match kind {
            StackKind::Undo => "undo",
            StackKind::Redo => "redo",
        })?;
        let (from, to) = match kind {
            StackKind::Undo => (&mut self.undo_stack, &mut self.redo_stack),
            StackKind::Redo => (&mut self.redo_stack, &mut self.undo_stack),
        };
        let entry = from.pop_back().ok_or(EngineError::EmptyStack(kind))?;
        if let Err(e) = entry.record.check(doc) {
            from.push_back(entry);
            return Err(e);
        }

        let HistoryEntry {
            label,
            record,
            pinned,
            state_before,
            state_after,
        } = entry;
        let before_size = record.memory_size();
        let inverse = record.revert(doc, &mut self.pool);
        let after_size = inverse.memory_size();

        to.push_back(HistoryEntry {
            label: label.clone(),
            record: inverse,
            pinned,
            state_before: state_after,
            state_after: state_before,
        });
        self.total_memory = (self.total_memory + after_size).saturating_sub(before_size);
        self.current_state = state_before;
        Ok(label)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.back().map(|e| e.label.as_str())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.back().map(|e| e.label.as_str())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<&str> {
        self.undo_stack.iter().rev().map(|e| e.label.as_str()).collect()
    }

    /// Kinds on the undo stack, oldest first.
    pub fn undo_kinds(&self) -> Vec<RecordKind> {
        self.undo_stack.iter().map(|e| e.record.kind()).collect()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Current memory usage of both stacks (cached total).
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    // -- clearing ------------------------------------------------------------

    pub fn clear_undo(&mut self) {
        while let Some(entry) = self.undo_stack.pop_back() {
            self.discard(entry);
        }
    }

    pub fn clear_redo(&mut self) {
        while let Some(entry) = self.redo_stack.pop_back() {
            self.discard(entry);
        }
    }

    pub fn clear(&mut self) {
        self.clear_undo();
        self.clear_redo();
    }

    /// Forget all history because the buffer was replaced from outside of it.
    /// Moves to a fresh state id so earlier save points no longer match.
    pub fn reset_baseline(&mut self) {
        self.clear();
        if let Some(stroke) = self.active_stroke.take() {
            self.pool.release(stroke.baseline.into_bytes());
        }
        self.current_state = self.allocate_state();
    }

    fn discard(&mut self, entry: HistoryEntry) {
        self.total_memory = self.total_memory.saturating_sub(entry.memory_size());
        entry.record.recycle(&mut self.pool);
    }

    // -- save point ----------------------------------------------------------

    pub fn mark_saved(&mut self) {
        self.saved_state = Some(self.current_state);
    }

    /// No reachable state counts as saved any more.
    pub fn detach_saved_state(&mut self) {
        self.saved_state = None;
    }

    pub fn is_at_saved_state(&self) -> bool {
        self.saved_state == Some(self.current_state)
    }

    pub fn current_state(&self) -> u64 {
        self.current_state
    }

    // -- governance ----------------------------------------------------------

    /// Exempt the newest undo entry from eviction. Returns `false` on an empty stack.
    pub fn pin_top(&mut self) -> bool {
        match self.undo_stack.back_mut() {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    fn evictable(&self, entry: &HistoryEntry) -> bool {
        if entry.pinned {
            return false;
        }
        match self.limits.eviction_scope {
            EvictionScope::All => true,
            EvictionScope::StrokesOnly => entry.record.kind() == RecordKind::StrokeDelta,
        }
    }

    /// Drop the oldest undo entries while over the count or memory limit.
    ///
    /// Only the bottom of the undo stack is ever removed: dropping from the middle
    /// would leave older patches applying over a state they were not captured from.
    /// A pinned (or out-of-scope) bottom entry therefore stops eviction.
    fn enforce_limits(&mut self) {
        let mut evicted = 0usize;
        while self.undo_stack.len() > 1 {
            let over_count = self.undo_stack.len() > self.limits.max_entries;
            let over_memory = self.total_memory > self.limits.memory_budget_bytes;
            if !over_count && !over_memory {
                break;
            }
            let bottom_ok = self
                .undo_stack
                .front()
                .map(|e| self.evictable(e))
                .unwrap_or(false);
            if !bottom_ok {
                break;
            }
            if let Some(entry) = self.undo_stack.pop_front() {
                self.discard(entry);
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::debug!(
                "history: evicted {} entr{} ({} bytes retained)",
                evicted,
                if evicted == 1 { "y" } else { "ies" },
                self.total_memory
            );
        }
    }
}
