// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to its defaults, so a missing or partial
// config.toml still gives a runnable host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backend::Extent;
use crate::pipeline::RetryPolicy;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub sync: SyncConfig,
    pub headless: HeadlessConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Fractal".to_string(),
            width: 1280,
            height: 1280,
        }
    }
}

impl WindowConfig {
    pub fn extent(&self) -> Extent {
        Extent {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            present_mode: "fifo".to_string(),
            clear_color: [0.042, 0.042, 0.042, 1.0],
            frames_in_flight: 3,
        }
    }
}

/// Shader source and reload settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub path: PathBuf,
    pub compiler: PathBuf,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub reload_interval_ms: u64,
    pub startup_attempts: u32,
    pub startup_backoff_ms: u64,
    pub startup_max_backoff_ms: u64,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shaders/mandelbrot.hlsl"),
            compiler: PathBuf::from("glslc"),
            vertex_entry: "VS_main".to_string(),
            fragment_entry: "PS_main".to_string(),
            reload_interval_ms: 1000,
            startup_attempts: 5,
            startup_backoff_ms: 100,
            startup_max_backoff_ms: 2000,
        }
    }
}

impl ShaderConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.startup_attempts,
            backoff: Duration::from_millis(self.startup_backoff_ms),
            max_backoff: Duration::from_millis(self.startup_max_backoff_ms),
        }
    }
}

/// Fence wait settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn fence_timeout(&self) -> Option<Duration> {
        (self.fence_timeout_ms > 0).then(|| Duration::from_millis(self.fence_timeout_ms))
    }
}

/// Software device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    /// Frames to render before closing; 0 runs until killed
    pub frames: u64,
    pub latency_ms: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            frames: 600,
            latency_ms: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "fractal-host.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("config.toml")).unwrap();

        assert_eq!(config.window.extent(), Extent { width: 1280, height: 1280 });
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.backend, BackendKind::Vulkan);
        assert_eq!(config.shaders.reload_interval(), Duration::from_secs(1));
        assert_eq!(config.sync.fence_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[graphics]\nbackend = \"headless\"\n\n[sync]\nfence_timeout_ms = 0\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.graphics.backend, BackendKind::Headless);
        assert_eq!(config.graphics.present_mode, "fifo");
        assert_eq!(config.sync.fence_timeout(), None);
        assert_eq!(config.shaders.vertex_entry, "VS_main");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[graphics]\nbackend = \"metal\"\n").unwrap();

        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let mut config = Config::default();
        config.graphics.present_mode = "tearing".to_string();
        assert_eq!(config.present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
