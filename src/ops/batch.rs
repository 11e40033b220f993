// ============================================================================
// BATCH JOBS: one transform across many documents, bounded concurrency
// ============================================================================
//
// The workspace decides eligibility and sources on the owning thread, then hands
// a list of units to `BatchJobRunner::start`. A coordinator thread takes one
// semaphore permit per unit and runs the unit on its own OS thread, so codec and
// blending state is never shared between concurrently running units. Results go
// back through the Dispatcher; tab state is only ever mutated by the owner.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::canvas::RasterDocument;
use crate::dispatch::{Dispatcher, WorkspaceEvent};
use crate::error::{EngineError, Result};
use crate::io;
use crate::ops::transform::{self, Interpolation, Watermark};
use crate::project::TabId;
use crate::settings::EngineSettings;

// ============================================================================
// OPERATIONS
// ============================================================================

#[derive(Clone, Debug)]
pub enum BatchOperation {
    Resize {
        width: u32,
        height: u32,
        interpolation: Interpolation,
    },
    Watermark(Watermark),
}

impl BatchOperation {
    pub fn resize(width: u32, height: u32) -> Self {
        BatchOperation::Resize {
            width,
            height,
            interpolation: Interpolation::default(),
        }
    }

    /// Short name used in output file names and logs.
    pub fn name(&self) -> &'static str {
        match self {
            BatchOperation::Resize { .. } => "resize",
            BatchOperation::Watermark(_) => "watermark",
        }
    }

    /// Worker slots: the processor count for resize, half of it for the costlier
    /// watermark path, unless settings override either.
    pub fn parallelism(&self, settings: &EngineSettings) -> usize {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        match self {
            BatchOperation::Resize { .. } => settings.resize_parallelism.unwrap_or(cpus),
            BatchOperation::Watermark(_) => settings.watermark_parallelism.unwrap_or((cpus / 2).max(1)),
        }
        .max(1)
    }

    pub fn apply(&self, doc: &RasterDocument) -> RasterDocument {
        match self {
            BatchOperation::Resize {
                width,
                height,
                interpolation,
            } => transform::resize_image(doc, *width, *height, *interpolation),
            BatchOperation::Watermark(watermark) => transform::stamp_watermark(doc, watermark),
        }
    }
}

// ============================================================================
// UNITS
// ============================================================================

/// Where a unit reads its pixels from.
#[derive(Clone, Debug)]
pub enum UnitSource {
    /// Buffer still held in memory (parked for an in-flight backup).
    Memory(Arc<RasterDocument>),
    /// Backup or original file on disk.
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct BatchUnit {
    pub tab: TabId,
    /// History state the source pixels belong to. `None` for closed tabs.
    pub base_state: Option<u64>,
    pub source: UnitSource,
    /// Fresh cache file the result is written to.
    pub output: PathBuf,
}

/// What a successful unit hands back to the owner.
#[derive(Debug)]
pub struct UnitOutput {
    pub backup_path: PathBuf,
    pub size: (u32, u32),
    pub thumbnail: RasterDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

fn run_unit(operation: &BatchOperation, unit: &BatchUnit, thumbnail_max_dim: u32) -> Result<UnitOutput> {
    let source = match &unit.source {
        UnitSource::Memory(doc) => doc.clone(),
        UnitSource::File(path) => Arc::new(io::load_document(path)?),
    };
    let result = operation.apply(&source);
    drop(source);
    io::write_png(&result, &unit.output)?;
    let thumbnail = transform::make_thumbnail(&result, thumbnail_max_dim);
    Ok(UnitOutput {
        backup_path: unit.output.clone(),
        size: result.size(),
        thumbnail,
    })
}

// ============================================================================
// SEMAPHORE
// ============================================================================

/// Counting semaphore. Permits are returned when the [`SemaphorePermit`] drops.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        })
    }

    /// Block until a permit is free.
    pub fn acquire(self: &Arc<Self>) -> SemaphorePermit {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit {
            semaphore: self.clone(),
        }
    }

    #[cfg(test)]
    fn try_acquire(self: &Arc<Self>) -> Option<SemaphorePermit> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphorePermit {
            semaphore: self.clone(),
        })
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

#[derive(Debug)]
pub struct SemaphorePermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

// ============================================================================
// PROGRESS
// ============================================================================

/// Shared completion counter, readable while the batch runs.
#[derive(Debug)]
pub struct BatchProgress {
    total: usize,
    completed: AtomicUsize,
    states: Mutex<Vec<UnitState>>,
}

impl BatchProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            states: Mutex::new(vec![UnitState::Pending; total]),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// `completed / total`; an empty batch counts as done.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed() as f32 / self.total as f32
        }
    }

    pub fn unit_states(&self) -> Vec<UnitState> {
        self.states.lock().clone()
    }

    fn set_state(&self, idx: usize, state: UnitState) {
        if let Some(slot) = self.states.lock().get_mut(idx) {
            *slot = state;
        }
    }

    fn finish(&self, idx: usize, state: UnitState) {
        self.set_state(idx, state);
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Summary handed to the owner once every unit has finished.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub id: u64,
    pub operation: &'static str,
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<(TabId, String)>,
    /// Tabs edited while their unit ran. Their results were thrown away.
    pub skipped: Vec<TabId>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.succeeded == self.total
    }
}

// ============================================================================
// RUNNER
// ============================================================================

pub struct BatchJobRunner {
    dispatcher: Dispatcher,
    parallelism: usize,
    thumbnail_max_dim: u32,
}

/// A running (or finished) batch.
#[derive(Debug)]
pub struct BatchHandle {
    pub id: u64,
    pub operation: &'static str,
    progress: Arc<BatchProgress>,
    coordinator: Option<JoinHandle<()>>,
}

impl BatchHandle {
    pub fn progress(&self) -> &Arc<BatchProgress> {
        &self.progress
    }

    /// Wait for the coordinator thread to exit. Called after `BatchFinished`.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.coordinator.take()
            && handle.join().is_err()
        {
            log::error!("batch {}: coordinator panicked", self.id);
        }
    }
}

impl BatchJobRunner {
    pub fn new(dispatcher: Dispatcher, parallelism: usize, thumbnail_max_dim: u32) -> Self {
        Self {
            dispatcher,
            parallelism: parallelism.max(1),
            thumbnail_max_dim,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Dispatch every unit. Returns immediately; one `BatchUnitFinished` is posted
    /// per unit and a final `BatchFinished` once all of them are done.
    pub fn start(self, id: u64, operation: BatchOperation, units: Vec<BatchUnit>) -> Result<BatchHandle> {
        let progress = Arc::new(BatchProgress::new(units.len()));
        let name = operation.name();
        let operation = Arc::new(operation);
        let semaphore = Semaphore::new(self.parallelism);
        let worker_progress = progress.clone();
        let dispatcher = self.dispatcher;
        let thumbnail_max_dim = self.thumbnail_max_dim;

        log::info!(
            "batch {}: {} over {} unit(s), {} slot(s)",
            id,
            name,
            units.len(),
            self.parallelism
        );

        let coordinator = thread::Builder::new()
            .name(format!("batch-{}", id))
            .spawn(move || {
                let mut workers = Vec::with_capacity(units.len());
                for (idx, unit) in units.into_iter().enumerate() {
                    let permit = semaphore.acquire();
                    worker_progress.set_state(idx, UnitState::Running);
                    let tab = unit.tab;
                    let base_state = unit.base_state;
                    let operation = operation.clone();
                    let progress = worker_progress.clone();
                    let unit_dispatcher = dispatcher.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("batch-{}-unit-{}", id, idx))
                        .spawn(move || {
                            let _permit = permit;
                            let outcome = catch_unwind(AssertUnwindSafe(|| {
                                run_unit(&operation, &unit, thumbnail_max_dim)
                            }))
                            .unwrap_or_else(|_| Err(EngineError::invalid_state("batch unit panicked")));
                            let outcome = match outcome {
                                Ok(output) => {
                                    log::info!("batch {}: {} {} OK", id, operation.name(), unit.tab);
                                    progress.finish(idx, UnitState::Succeeded);
                                    Ok(output)
                                }
                                Err(e) => {
                                    log::error!("batch {}: {} {} FAILED: {}", id, operation.name(), unit.tab, e);
                                    progress.finish(idx, UnitState::Failed);
                                    Err(e.to_string())
                                }
                            };
                            unit_dispatcher.post(WorkspaceEvent::BatchUnitFinished {
                                batch: id,
                                tab: unit.tab,
                                base_state: unit.base_state,
                                outcome,
                            });
                        });
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(e) => {
                            log::error!("batch {}: could not start unit for {}: {}", id, tab, e);
                            worker_progress.finish(idx, UnitState::Failed);
                            dispatcher.post(WorkspaceEvent::BatchUnitFinished {
                                batch: id,
                                tab,
                                base_state,
                                outcome: Err(format!("could not start worker: {}", e)),
                            });
                        }
                    }
                }
                for worker in workers {
                    if worker.join().is_err() {
                        log::error!("batch {}: worker thread panicked", id);
                    }
                }
                dispatcher.post(WorkspaceEvent::BatchFinished { batch: id });
            })
            .map_err(|e| EngineError::io(PathBuf::from(format!("batch-{}", id)), e))?;

        Ok(BatchHandle {
            id,
            operation: name,
            progress,
            coordinator: Some(coordinator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch;
    use std::time::Duration;

    #[test]
    fn semaphore_bounds_holders() {
        let sem = Semaphore::new(2);
        let a = sem.acquire();
        let _b = sem.acquire();
        assert!(sem.try_acquire().is_none());
        drop(a);
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    fn semaphore_limits_concurrency() {
        let sem = Semaphore::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..6)
            .map(|_| {
                let permit = sem.acquire();
                let running = running.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let _permit = permit;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn failed_unit_does_not_stop_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let (dispatcher, queue) = dispatch::channel();
        let ok_tab = TabId::new();
        let bad_tab = TabId::new();
        let units = vec![
            BatchUnit {
                tab: bad_tab,
                base_state: None,
                source: UnitSource::File(tmp.path().join("missing.png")),
                output: tmp.path().join("bad_out.png"),
            },
            BatchUnit {
                tab: ok_tab,
                base_state: Some(3),
                source: UnitSource::Memory(Arc::new(RasterDocument::new(20, 10))),
                output: tmp.path().join("ok_out.png"),
            },
        ];
        let handle = BatchJobRunner::new(dispatcher, 1, 4)
            .start(7, BatchOperation::resize(4, 2), units)
            .unwrap();

        let mut finished = Vec::new();
        loop {
            match queue.next_timeout(Duration::from_secs(30)) {
                Some(WorkspaceEvent::BatchUnitFinished { tab, outcome, .. }) => finished.push((tab, outcome)),
                Some(WorkspaceEvent::BatchFinished { batch }) => {
                    assert_eq!(batch, 7);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(finished.len(), 2);
        for (tab, outcome) in &finished {
            if *tab == ok_tab {
                let out = outcome.as_ref().unwrap();
                assert_eq!(out.size, (4, 2));
                assert!(out.backup_path.exists());
            } else {
                assert!(outcome.is_err());
            }
        }
        assert!(!tmp.path().join("bad_out.png").exists());
        assert_eq!(handle.progress().completed(), 2);
        assert_eq!(
            handle.progress().unit_states(),
            vec![UnitState::Failed, UnitState::Succeeded]
        );
    }
}
