// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

/// Smallest swap chain we will ask for.
pub const MIN_BACK_BUFFERS: u32 = 2;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
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
            title: "Hello Triangle".to_string(),
            width: 720,
            height: 480,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub back_buffer_count: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.117, 0.117, 0.120, 1.0],
            back_buffer_count: MIN_BACK_BUFFERS,
        }
    }
}

/// Where the shader source lives and which entry points to compile
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub path: PathBuf,
    pub vertex_entry: String,
    pub pixel_entry: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shaders/triangle.wgsl"),
            vertex_entry: "vs".to_string(),
            pixel_entry: "ps".to_string(),
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
    pub hot_reload_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "hello_triangle.log".to_string(),
            show_fps: true,
            hot_reload_shaders: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: "Escape".to_string(),
        }
    }
}

/// Where the configuration came from. Loading happens before the logger is
/// installed, so the outcome is kept and reported afterwards.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file; defaults used
    Missing(PathBuf),
    /// The file could not be read or parsed; defaults used
    Invalid(PathBuf, anyhow::Error),
}

impl ConfigSource {
    pub fn report(&self) -> (log::Level, String) {
        match self {
            ConfigSource::File(path) => (
                log::Level::Info,
                format!("Loaded configuration from {:?}", path),
            ),
            ConfigSource::Missing(path) => (
                log::Level::Info,
                format!("Config file not found at {:?}, using defaults", path),
            ),
            ConfigSource::Invalid(path, e) => (
                log::Level::Warn,
                format!("Failed to load {:?}: {:#}. Using defaults.", path, e),
            ),
        }
    }

    pub fn log(&self) {
        let (level, message) = self.report();
        log::log!(level, "{}", message);
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to
    /// defaults if it is missing or broken
    pub fn load() -> (Self, ConfigSource) {
        Self::load_or_default(CONFIG_FILE)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();

        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(path.to_path_buf(), e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum.
    /// FIFO waits for the vertical blank, i.e. a sync interval of 1.
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
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

    pub fn back_buffer_count(&self) -> u32 {
        self.graphics.back_buffer_count.max(MIN_BACK_BUFFERS)
    }

    /// Shader path as given, or relative to the crate root when running
    /// from somewhere else (e.g. `cargo run` from a subdirectory).
    pub fn shader_path(&self) -> PathBuf {
        let path = &self.shaders.path;
        if path.is_absolute() || path.exists() {
            return path.clone();
        }
        let fallback = Path::new(env!("CARGO_MANIFEST_DIR")).join(path);
        if fallback.exists() {
            fallback
        } else {
            path.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 720);
        assert_eq!(config.window.height, 480);
        assert_eq!(config.back_buffer_count(), 2);
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.shaders.vertex_entry, "vs");
        assert_eq!(config.shaders.pixel_entry, "ps");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1280

            [graphics]
            present_mode = "Mailbox"
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 480);
        assert_eq!(config.window.title, "Hello Triangle");
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.graphics.clear_color, [0.117, 0.117, 0.120, 1.0]);
    }

    #[test]
    fn back_buffer_count_never_drops_below_two() {
        let config = Config::parse("[graphics]\nback_buffer_count = 1\n").unwrap();
        assert_eq!(config.back_buffer_count(), 2);
        let config = Config::parse("[graphics]\nback_buffer_count = 3\n").unwrap();
        assert_eq!(config.back_buffer_count(), 3);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_vsync() {
        let config = Config::parse("[graphics]\npresent_mode = \"sometimes\"\n").unwrap();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let (config, source) = Config::load_or_default("definitely/not/here.toml");
        assert!(config.debug.show_fps);
        assert!(matches!(source, ConfigSource::Missing(_)));
        assert_eq!(source.report().0, log::Level::Info);
    }

    #[test]
    fn broken_file_falls_back_and_reports_why() {
        let path = std::env::temp_dir().join(format!("hello-triangle-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, source) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 720);
        assert!(matches!(source, ConfigSource::Invalid(..)));

        let (level, message) = source.report();
        assert_eq!(level, log::Level::Warn);
        assert!(message.contains("Failed to parse config file"), "{message}");
        assert!(message.contains("Using defaults"), "{message}");
    }

    #[test]
    fn valid_file_is_reported_as_loaded() {
        let path = std::env::temp_dir().join(format!("hello-triangle-valid-{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\nwidth = 1024\n").unwrap();

        let (config, source) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 1024);
        assert!(matches!(source, ConfigSource::File(_)));
        assert!(source.report().1.starts_with("Loaded configuration"));
    }
}
