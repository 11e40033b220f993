//! Session logger: backs the `log` facade with a single file in the OS data directory.
//!
//! The file is **truncated (overwritten) at each launch**, so it only ever
//! contains output from the most-recent session.  This prevents the log from
//! growing unboundedly.
//!
//! Log location:
//!   Windows:  `%APPDATA%\PaintFE\paintfe-core.log`
//!   Linux:    `~/.local/share/PaintFE/paintfe-core.log`
//!   macOS:    `~/Library/Application Support/PaintFE/paintfe-core.log`
//!
//! Usage: call [`init`] once, then use `log::info!` / `log::warn!` /
//! `log::error!` anywhere in the crate.  Panics are mirrored to the log through
//! a panic hook before the default handler runs.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::settings::data_dir;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

struct SessionLogger {
    file: Mutex<File>,
    /// Mirror records to stderr (CLI `--verbose`).
    echo: bool,
}

impl Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] [{}] {}",
            timestamp(),
            record.level(),
            record.args()
        );
        // Silently ignore I/O errors so that logging never crashes the application.
        let _ = writeln!(self.file.lock(), "{}", line);
        if self.echo {
            eprintln!("{}", line);
        }
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

/// Initialise the session logger at the default location.
///
/// * Creates (or truncates) the log file.
/// * Installs a panic hook that writes the panic message to the log before
///   propagating to the default handler.
pub fn init(level: LevelFilter, echo: bool) {
    init_at(&log_file_path(), level, echo);
}

/// Same as [`init`] with an explicit file location.
pub fn init_at(path: &Path, level: LevelFilter, echo: bool) {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    // Open file, truncating any previous session's content
    let file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => {
            // Can't open log file: not fatal, just skip
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            return;
        }
    };

    let logger = SessionLogger {
        file: Mutex::new(file),
        echo,
    };
    if log::set_boxed_logger(Box::new(logger)).is_err() {
        // Someone else already installed a logger (tests, embedding app).
        return;
    }
    log::set_max_level(level);
    let _ = LOG_PATH.set(path.to_path_buf());

    log::info!(
        "=== PaintFE core session started {} ===",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    log::info!("Log file: {}", path.display());

    // Install panic hook: mirrors panic info to the log, then runs default handler
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC: {}", info);
        log::logger().flush();
        prev(info);
    }));
}

fn log_file_path() -> PathBuf {
    data_dir().join("PaintFE").join("paintfe-core.log")
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}
