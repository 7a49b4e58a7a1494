//! Configuration loaded from `frameslot.toml`.
//!
//! Every section has defaults, so a missing file or a partial file is fine.
//! A file that exists but cannot be parsed is reported as an error.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// File name looked up by [`Config::load`].
pub const DEFAULT_CONFIG_FILE: &str = "frameslot.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingSettings,
    pub readback: ReadbackSettings,
    pub frames: FrameSettings,
    pub session: SessionSettings,
    pub app: AppSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing filter; `RUST_LOG` overrides it.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info,frameslot=debug".to_string(),
        }
    }
}

/// Output pixel format of the readback pipeline.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Four channels, 8 bits each.
    Rgba,
    /// Single 8-bit luma channel.
    I8,
}

/// Texture readback settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadbackSettings {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub keep_aspect_ratio: bool,
    /// Number of readback slots; the maximum number of unreleased requests.
    pub buffer_count: usize,
    pub fence_timeout_ms: u64,
}

impl Default for ReadbackSettings {
    fn default() -> Self {
        Self {
            format: ImageFormat::I8,
            width: 640,
            height: 480,
            keep_aspect_ratio: false,
            buffer_count: 2,
            fence_timeout_ms: 1000,
        }
    }
}

/// Frames-in-flight settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameSettings {
    pub frames_in_flight: usize,
    pub fence_timeout_ms: u64,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 4,
            fence_timeout_ms: 100,
        }
    }
}

/// Synthetic AR session settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Camera image width.
    pub width: u32,
    /// Camera image height.
    pub height: u32,
    /// Display rotation in degrees (0, 90, 180 or 270).
    pub rotation: u32,
    /// Optional PNG shown instead of the generated pattern.
    pub backdrop: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            rotation: 0,
            backdrop: None,
        }
    }
}

/// Demo application settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    /// Number of frames to draw before exiting.
    pub frames: u64,
    /// Swapchain image count of the headless display.
    pub swapchain_images: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            frames: 240,
            swapchain_images: 3,
        }
    }
}

impl Config {
    /// Load `frameslot.toml` from the working directory, falling back to
    /// defaults if it is missing or broken.
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_FILE).unwrap_or_else(|e| {
            warn!("Failed to load {}: {}. Using defaults.", DEFAULT_CONFIG_FILE, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!("Loaded configuration from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that the pools cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.readback.buffer_count == 0 {
            return Err(Error::InvalidValue {
                key: "readback.buffer_count",
                message: "must be at least 1".to_string(),
            });
        }
        if self.readback.width == 0 || self.readback.height == 0 {
            return Err(Error::InvalidValue {
                key: "readback.width",
                message: format!(
                    "output size {}x{} must be non-zero",
                    self.readback.width, self.readback.height
                ),
            });
        }
        if self.frames.frames_in_flight == 0 {
            return Err(Error::InvalidValue {
                key: "frames.frames_in_flight",
                message: "must be at least 1".to_string(),
            });
        }
        if !matches!(self.session.rotation, 0 | 90 | 180 | 270) {
            return Err(Error::InvalidValue {
                key: "session.rotation",
                message: format!("{} is not a multiple of 90 degrees", self.session.rotation),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_samples() {
        let config = Config::default();
        assert_eq!(config.readback.buffer_count, 2);
        assert_eq!(config.readback.format, ImageFormat::I8);
        assert_eq!(config.frames.frames_in_flight, 4);
        assert_eq!(config.frames.fence_timeout_ms, 100);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [readback]
            format = "rgba"
            width = 1024
            height = 512
            keep_aspect_ratio = true
            "#,
        )
        .unwrap();

        assert_eq!(config.readback.format, ImageFormat::Rgba);
        assert_eq!(config.readback.width, 1024);
        assert!(config.readback.keep_aspect_ratio);
        assert_eq!(config.readback.buffer_count, 2);
        assert_eq!(config.frames, FrameSettings::default());
    }

    #[test]
    fn test_zero_buffer_count_is_rejected() {
        let err = Config::from_toml("[readback]\nbuffer_count = 0\n").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidValue {
                key: "readback.buffer_count",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_rotation_is_rejected() {
        assert!(Config::from_toml("[session]\nrotation = 45\n").is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = Config::from_toml("[readback\nwidth = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frameslot.toml");
        std::fs::write(&path, "[frames]\nframes_in_flight = 3\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.frames.frames_in_flight, 3);
    }
}
