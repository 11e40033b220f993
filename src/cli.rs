// ============================================================================
// paintfe-batch: headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   paintfe-batch resize -i *.jpg --width 1280 --height 720 --output-dir out/
//   paintfe-batch resize -i shots/*.png --width 64 --height 64 --filter nearest --output-dir thumbs/
//   paintfe-batch watermark -i a.png b.png --stamp logo.png --anchor top-left --output-dir out/
//   paintfe-batch session
//
// Inputs are opened as workspace tabs behind a scratch active tab, so the batch
// runs through exactly the same eligibility, worker and result path as the editor.
// Outputs are always written as PNG.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};

use paintfe_core::io;
use paintfe_core::ops::batch::BatchOperation;
use paintfe_core::ops::transform::{Anchor, Interpolation, Watermark};
use paintfe_core::persistence;
use paintfe_core::project::TabId;
use paintfe_core::settings::EngineSettings;
use paintfe_core::workspace::Workspace;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PaintFE headless batch image processor.
#[derive(Parser, Debug)]
#[command(
    name = "paintfe-batch",
    version,
    about = "PaintFE headless batch image processor",
    long_about = "Resize or watermark many images at once without opening the editor.\n\
                  Reads PNG, JPEG, WEBP, BMP, TGA, ICO and TIFF; writes PNG.\n\n\
                  Example:\n  \
                  paintfe-batch resize -i *.jpg --width 800 --height 600 --output-dir out/"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (defaults to the per-user paintfe_core.cfg).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print per-file results and mirror the log to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resample every input to a fixed size.
    Resize {
        #[command(flatten)]
        io: BatchIo,

        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        /// nearest, bilinear, bicubic, lanczos3
        #[arg(long, default_value = "bilinear")]
        filter: String,
    },
    /// Blend a stamp image onto every input.
    Watermark {
        #[command(flatten)]
        io: BatchIo,

        /// Stamp image, usually a PNG with alpha.
        #[arg(long, value_name = "FILE")]
        stamp: PathBuf,

        /// 0.0 – 1.0
        #[arg(long, default_value_t = 0.5)]
        opacity: f32,

        /// top-left, top-right, bottom-left, bottom-right, center
        #[arg(long, default_value = "bottom-right")]
        anchor: String,

        #[arg(long, default_value_t = 16)]
        margin: u32,
    },
    /// Print the tabs recorded in a session file.
    Session {
        /// Session file (defaults to the one in the cache directory).
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct BatchIo {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output directory; files keep their stem and get a .png extension.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: PathBuf,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the requested command and return an OS exit code.
/// `0` = every file succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = match &args.config {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };

    match args.command {
        Command::Session { path } => print_session(&path.unwrap_or_else(|| settings.session_path())),
        Command::Resize {
            io,
            width,
            height,
            filter,
        } => {
            let Some(interpolation) = Interpolation::parse(&filter) else {
                eprintln!("error: unknown filter '{}'.", filter);
                return ExitCode::FAILURE;
            };
            let operation = BatchOperation::Resize {
                width,
                height,
                interpolation,
            };
            run_batch(settings, &io, operation, args.verbose)
        }
        Command::Watermark {
            io,
            stamp,
            opacity,
            anchor,
            margin,
        } => {
            let Some(anchor) = Anchor::parse(&anchor) else {
                eprintln!("error: unknown anchor '{}'.", anchor);
                return ExitCode::FAILURE;
            };
            let stamp_doc = match io::load_document(&stamp) {
                Ok(doc) => doc,
                Err(e) => {
                    eprintln!("error: could not read stamp '{}': {}", stamp.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let mut watermark = Watermark::new(stamp_doc);
            watermark.anchor = anchor;
            watermark.opacity = opacity.clamp(0.0, 1.0);
            watermark.margin = margin;
            run_batch(settings, &io, BatchOperation::Watermark(watermark), args.verbose)
        }
    }
}

// ============================================================================
// Batch pipeline
// ============================================================================

fn run_batch(mut settings: EngineSettings, io_args: &BatchIo, operation: BatchOperation, verbose: bool) -> ExitCode {
    // Resolve glob patterns / literal paths → concrete PathBufs
    let inputs = resolve_inputs(&io_args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if let Err(e) = std::fs::create_dir_all(&io_args.output_dir) {
        eprintln!(
            "error: could not create output directory '{}': {}",
            io_args.output_dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    // Private cache so a running editor session is never touched.
    let scratch = settings
        .resolved_cache_dir()
        .join(format!("batch-{}", uuid::Uuid::new_v4().simple()));
    settings.cache_dir = Some(scratch.clone());
    settings.idle_backup_seconds = 0;

    let code = match process(settings, &inputs, &io_args.output_dir, operation, verbose) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    };
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        log::warn!("cli: could not remove {}: {}", scratch.display(), e);
    }
    code
}

fn process(
    settings: EngineSettings,
    inputs: &[PathBuf],
    output_dir: &Path,
    operation: BatchOperation,
    verbose: bool,
) -> paintfe_core::Result<bool> {
    let start = Instant::now();
    let mut workspace = Workspace::new(settings)?;
    let mut any_failure = false;
    let mut opened: Vec<(TabId, PathBuf)> = Vec::new();

    for input in inputs {
        match workspace.open_file(input) {
            Ok(id) => opened.push((id, input.clone())),
            Err(e) => {
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }
    // Scratch tab takes the active slot so every input is eligible.
    workspace.new_tab(1, 1)?;

    let name = operation.name();
    workspace.run_batch(operation)?;
    while workspace.is_batch_running() {
        workspace.wait_for_background(Duration::from_millis(200));
        if verbose && let Some(progress) = workspace.batch_progress() {
            println!("  {} {}/{}", name, progress.completed(), progress.total());
        }
    }
    workspace.wait_for_background(Duration::from_secs(30));

    let Some(report) = workspace.take_batch_report() else {
        return Ok(false);
    };
    for (tab, error) in &report.failed {
        let input = opened.iter().find(|(id, _)| id == tab).map(|(_, p)| p.display().to_string());
        eprintln!("  error: {}: {}", input.unwrap_or_else(|| tab.to_string()), error);
        any_failure = true;
    }

    let total = opened.len();
    for (idx, (id, input)) in opened.iter().enumerate() {
        if report.failed.iter().any(|(t, _)| t == id) {
            continue;
        }
        let Some(result) = workspace.tab(*id).and_then(|t| t.backup_path.clone()) else {
            continue;
        };
        let Some(output) = build_output_path(input, output_dir) else {
            eprintln!("  error: cannot determine output path for '{}'.", input.display());
            any_failure = true;
            continue;
        };
        match std::fs::copy(&result, &output) {
            Ok(_) => {
                if verbose || total > 1 {
                    println!("[{}/{}] {} → {}", idx + 1, total, input.display(), output.display());
                }
            }
            Err(e) => {
                eprintln!("  error: could not write '{}': {}", output.display(), e);
                any_failure = true;
            }
        }
    }

    println!(
        "{}: {}/{} succeeded ({:.0}ms)",
        report.operation,
        report.succeeded,
        report.total,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(!any_failure)
}

fn print_session(path: &Path) -> ExitCode {
    match persistence::load_session(path) {
        Ok(Some(file)) => {
            println!("{} (saved {})", path.display(), file.saved_at.format("%Y-%m-%d %H:%M:%S"));
            for entry in &file.tabs {
                let marker = if file.active_tab == Some(entry.id) { ">" } else { " " };
                let dirty = if entry.is_dirty { "*" } else { "" };
                println!(
                    "{} {}{}  {}x{}  {}",
                    marker,
                    entry.name,
                    dirty,
                    entry.width,
                    entry.height,
                    entry
                        .original_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "(unsaved)".to_string())
                );
            }
            for entry in &file.retained {
                println!("  [closed] {}*  backup kept", entry.name);
            }
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("no session at {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let before = result.len();
                for entry in entries.flatten().filter(|p| io::is_image_path(p)) {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                }
                if result.len() == before {
                    eprintln!("warning: pattern '{}' matched no images.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// `{output_dir}/{input stem}.png`
fn build_output_path(input: &Path, output_dir: &Path) -> Option<PathBuf> {
    let stem = input.file_stem()?.to_string_lossy().into_owned();
    Some(output_dir.join(format!("{}.png", stem)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize_command() {
        let args = CliArgs::try_parse_from([
            "paintfe-batch",
            "resize",
            "-i",
            "a.png",
            "b.png",
            "--width",
            "10",
            "--height",
            "20",
            "-o",
            "out",
        ])
        .unwrap();
        match args.command {
            Command::Resize { io, width, height, filter } => {
                assert_eq!(io.input, vec!["a.png", "b.png"]);
                assert_eq!((width, height), (10, 20));
                assert_eq!(filter, "bilinear");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn glob_expansion_skips_non_images() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.jpg", "c.txt"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let pattern = format!("{}/*", tmp.path().display());
        let found = resolve_inputs(&[pattern]);
        assert_eq!(found, vec![tmp.path().join("a.png"), tmp.path().join("b.jpg")]);
    }

    #[test]
    fn output_keeps_stem() {
        assert_eq!(
            build_output_path(Path::new("/in/photo.jpg"), Path::new("/out")),
            Some(PathBuf::from("/out/photo.png"))
        );
    }
}
