// ============================================================================
// ENGINE SETTINGS - plain key=value file
// ============================================================================

use std::path::{Path, PathBuf};

use crate::error::EngineResult;
use crate::ops::compositor::DEFAULT_THUMBNAIL_WIDTH;
use crate::ops::selection::DEFAULT_THRESHOLD_BIAS;

const SETTINGS_FILE: &str = "rasterstack_settings.cfg";

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Checkpoint thumbnails are at most this wide.
    pub thumbnail_max_width: u32,
    /// Default flood fill / magic wand tolerance (0..=255).
    pub fill_tolerance: u8,
    /// Grow/shrink threshold offset from mid-grey for selection refinement.
    pub grow_threshold_bias: u8,
    /// Whether the CLI opens a session log file.
    pub log_to_file: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            thumbnail_max_width: DEFAULT_THUMBNAIL_WIDTH,
            fill_tolerance: 32,
            grow_threshold_bias: DEFAULT_THRESHOLD_BIAS,
            log_to_file: true,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/rasterstack/rasterstack_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\rasterstack\rasterstack_settings.cfg
    /// On macOS:   ~/Library/Application Support/rasterstack/rasterstack_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("rasterstack");
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("rasterstack").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("rasterstack")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join(SETTINGS_FILE)))
        }
    }

    /// Load from the default location (defaults if missing or unreadable).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn save(&self) -> EngineResult<()> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    /// Unknown keys are ignored; a malformed value keeps its default.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "thumbnail_max_width" => {
                    s.thumbnail_max_width = val.parse().ok().filter(|w| *w > 0).unwrap_or(DEFAULT_THUMBNAIL_WIDTH);
                }
                "fill_tolerance" => {
                    s.fill_tolerance = val.parse().unwrap_or(32);
                }
                "grow_threshold_bias" => {
                    s.grow_threshold_bias = val.parse().ok().filter(|b| *b < 128).unwrap_or(DEFAULT_THRESHOLD_BIAS);
                }
                "log_to_file" => {
                    s.log_to_file = val != "false";
                }
                _ => {}
            }
        }
        s
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = format!(
            "thumbnail_max_width={}\n\
             fill_tolerance={}\n\
             grow_threshold_bias={}\n\
             log_to_file={}\n",
            self.thumbnail_max_width, self.fill_tolerance, self.grow_threshold_bias, self.log_to_file,
        );
        std::fs::write(path, content)?;
        Ok(())
    }
}
