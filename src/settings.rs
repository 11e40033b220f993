use std::path::{Path, PathBuf};

use crate::components::history::{EvictionScope, HistoryLimits};

/// Tunables for the document core.
///
/// Persisted as a plain `key = value` file, one setting per line. Unknown keys are
/// ignored and malformed values keep their defaults, so old files keep loading.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of undo steps per document
    pub max_undo_steps: usize,
    /// Combined undo + redo footprint per document before old history is dropped
    pub undo_memory_budget_mb: usize,
    pub eviction_scope: EvictionScope,
    /// Pixel buffers each history keeps around for reuse
    pub buffer_pool_capacity: usize,
    /// `None` uses `<data dir>/PaintFE/cache`
    pub cache_dir: Option<PathBuf>,
    /// Session file name inside the cache directory
    pub session_file: String,
    /// Idle interval before the active tab is backed up (0 = disabled)
    pub idle_backup_seconds: u64,
    /// Longest edge of tab thumbnails
    pub thumbnail_max_dim: u32,
    /// Worker slots for resize batches (`None` = processor count)
    pub resize_parallelism: Option<usize>,
    /// Worker slots for watermark batches (`None` = half the processor count)
    pub watermark_parallelism: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            undo_memory_budget_mb: 100,
            eviction_scope: EvictionScope::All,
            buffer_pool_capacity: 4,
            cache_dir: None,
            session_file: "session.json".to_string(),
            idle_backup_seconds: 60,
            thumbnail_max_dim: 256,
            resize_parallelism: None,
            watermark_parallelism: None,
        }
    }
}

impl EngineSettings {
    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_entries: self.max_undo_steps.max(1),
            memory_budget_bytes: self.undo_memory_budget_mb.saturating_mul(1024 * 1024),
            eviction_scope: self.eviction_scope,
            pool_capacity: self.buffer_pool_capacity,
        }
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("PaintFE").join("cache"))
    }

    pub fn session_path(&self) -> PathBuf {
        self.resolved_cache_dir().join(&self.session_file)
    }

    /// `<config dir>/paintfe/paintfe_core.cfg`
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            // Use %APPDATA% so the settings are stored in the user profile
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("PaintFE").join("paintfe_core.cfg"));
        }
        #[cfg(not(target_os = "windows"))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("paintfe").join("paintfe_core.cfg"))
        }
    }

    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "max_undo_steps" => {
                    if let Ok(v) = val.parse() {
                        s.max_undo_steps = v;
                    }
                }
                "undo_memory_budget_mb" => {
                    if let Ok(v) = val.parse() {
                        s.undo_memory_budget_mb = v;
                    }
                }
                "eviction_scope" => {
                    if let Some(v) = EvictionScope::parse(val) {
                        s.eviction_scope = v;
                    }
                }
                "buffer_pool_capacity" => {
                    if let Ok(v) = val.parse() {
                        s.buffer_pool_capacity = v;
                    }
                }
                "cache_dir" => {
                    s.cache_dir = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
                }
                "session_file" => {
                    if !val.is_empty() {
                        s.session_file = val.to_string();
                    }
                }
                "idle_backup_seconds" => {
                    if let Ok(v) = val.parse() {
                        s.idle_backup_seconds = v;
                    }
                }
                "thumbnail_max_dim" => {
                    if let Ok(v) = val.parse::<u32>() {
                        s.thumbnail_max_dim = v.max(1);
                    }
                }
                "resize_parallelism" => s.resize_parallelism = parse_slots(val),
                "watermark_parallelism" => s.watermark_parallelism = parse_slots(val),
                _ => {}
            }
        }
        s
    }

    pub fn to_cfg_string(&self) -> String {
        let slots = |v: Option<usize>| v.map(|n| n.to_string()).unwrap_or_else(|| "auto".to_string());
        let mut out = String::new();
        out.push_str(&format!("max_undo_steps={}\n", self.max_undo_steps));
        out.push_str(&format!("undo_memory_budget_mb={}\n", self.undo_memory_budget_mb));
        out.push_str(&format!("eviction_scope={}\n", self.eviction_scope.as_str()));
        out.push_str(&format!("buffer_pool_capacity={}\n", self.buffer_pool_capacity));
        out.push_str(&format!(
            "cache_dir={}\n",
            self.cache_dir.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        ));
        out.push_str(&format!("session_file={}\n", self.session_file));
        out.push_str(&format!("idle_backup_seconds={}\n", self.idle_backup_seconds));
        out.push_str(&format!("thumbnail_max_dim={}\n", self.thumbnail_max_dim));
        out.push_str(&format!("resize_parallelism={}\n", slots(self.resize_parallelism)));
        out.push_str(&format!("watermark_parallelism={}\n", slots(self.watermark_parallelism)));
        out
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_cfg_string())
    }
}

fn parse_slots(val: &str) -> Option<usize> {
    match val.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => None,
    }
}

/// Platform data directory (without the app sub-folder).
pub(crate) fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }
    // Linux / fallback
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort: current working directory
    PathBuf::from(".")
}
