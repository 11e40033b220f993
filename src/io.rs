use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::canvas::RasterDocument;
use crate::error::{EngineError, Result};
use crate::project::TabId;

/// Extensions the workspace treats as openable images (folder navigation order).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tga", "ico", "tif", "tiff"];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

// ============================================================================
// CACHE DIRECTORY
// ============================================================================

/// Ephemeral export targets under the cache root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportTarget {
    Clipboard,
    Drag,
}

impl ExportTarget {
    fn dir_name(&self) -> &'static str {
        match self {
            ExportTarget::Clipboard => "ClipboardTemp",
            ExportTarget::Drag => "DragTemp",
        }
    }
}

/// Layout of the disposable cache store.
///
/// ```text
/// {root}/{tabId}.png                      backups and blank placeholders
/// {root}/{tabId}_{operation}_{stamp}.png  batch outputs
/// {root}/ClipboardTemp/*                  clipboard exports
/// {root}/DragTemp/*                       drag-and-drop exports
/// ```
#[derive(Clone, Debug)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| EngineError::io(&self.root, e))
    }

    pub fn backup_path(&self, tab: TabId) -> PathBuf {
        self.root.join(format!("{}.png", tab))
    }

    /// Collision-free output name for one batch unit.
    pub fn batch_output_path(&self, tab: TabId, operation: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        self.root.join(format!("{}_{}_{}.png", tab, operation, stamp))
    }

    pub fn export_dir(&self, target: ExportTarget) -> PathBuf {
        self.root.join(target.dir_name())
    }

    /// True for files this cache is allowed to delete.
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Delete a cache file. Paths outside the cache and missing files are ignored.
    pub fn remove_disposable(&self, path: &Path) {
        if !self.owns(path) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => log::debug!("cache: removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("cache: could not remove {}: {}", path.display(), e),
        }
    }

    /// Clear `ClipboardTemp/` and `DragTemp/`.
    pub fn purge_ephemeral(&self) {
        for target in [ExportTarget::Clipboard, ExportTarget::Drag] {
            let dir = self.export_dir(target);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("cache: could not purge {}: {}", dir.display(), e),
            }
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Synchronously decode any supported image into a BGRA document.
pub fn load_document(path: &Path) -> Result<RasterDocument> {
    let img = image::open(path).map_err(|e| EngineError::codec(path, e))?;
    Ok(RasterDocument::from_rgba_image(&img.to_rgba8()))
}

/// Encode as PNG through a temp file + rename, so readers never see a partial file.
pub fn write_png(doc: &RasterDocument, path: &Path) -> Result<()> {
    write_with_format(doc, path, ImageFormat::Png)
}

/// Save in the format implied by the extension (PNG when unknown).
pub fn save_document(doc: &RasterDocument, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    write_with_format(doc, path, format)
}

fn write_with_format(doc: &RasterDocument, path: &Path, format: ImageFormat) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    let tmp = temp_sibling(path);
    let image = DynamicImage::ImageRgba8(doc.to_rgba_image());
    let encoded = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&tmp, format),
        _ => image.save_with_format(&tmp, format),
    };
    if let Err(e) = encoded {
        let _ = fs::remove_file(&tmp);
        return Err(EngineError::codec(path, e));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EngineError::io(path, e)
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Image files in the same folder as `path`, sorted by name.
pub fn sibling_images(path: &Path) -> Vec<PathBuf> {
    let Some(dir) = path.parent() else { return Vec::new() };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image_path(p))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_round_trip_is_lossless() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.png");
        let mut doc = RasterDocument::new(3, 2);
        doc.set_pixel(1, 1, [10, 20, 30, 40]);
        write_png(&doc, &path).unwrap();
        assert_eq!(load_document(&path).unwrap(), doc);
        // No temp file left behind
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn missing_file_is_io_failure() {
        let err = load_document(Path::new("/definitely/not/here.png")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
    }

    #[test]
    fn cache_only_removes_its_own_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(tmp.path().join("cache"));
        cache.ensure().unwrap();
        let outside = tmp.path().join("keep.png");
        fs::write(&outside, b"x").unwrap();
        cache.remove_disposable(&outside);
        assert!(outside.exists());

        let id = TabId::new();
        let inside = cache.backup_path(id);
        fs::write(&inside, b"x").unwrap();
        cache.remove_disposable(&inside);
        assert!(!inside.exists());
    }

    #[test]
    fn siblings_are_sorted_images() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let found = sibling_images(&tmp.path().join("b.png"));
        assert_eq!(found, vec![tmp.path().join("a.jpg"), tmp.path().join("b.png")]);
    }
}
