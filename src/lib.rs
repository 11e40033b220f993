//! Document core of the PaintFE raster editor: per-document undo history, the
//! multi-tab workspace with background cache persistence, and the batch runner
//! that applies one transform across many open documents.
//!
//! Everything that mutates tab state runs on the thread that owns the
//! [`Workspace`]. Background work (backups, session writes, batch units) reports
//! back through a [`dispatch::Dispatcher`] and is applied by
//! [`Workspace::pump_events`].

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod canvas;
pub mod components;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod persistence;
pub mod project;
pub mod settings;
pub mod workspace;

pub use canvas::{PixelRect, RasterDocument};
pub use components::history::{EvictionScope, HistoryLimits, UndoEngine, UndoRecord};
pub use error::{EngineError, ErrorKind, Result};
pub use ops::batch::{BatchOperation, BatchReport};
pub use project::{TabId, TabSession};
pub use settings::EngineSettings;
pub use workspace::Workspace;
