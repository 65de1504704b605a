//! Configuration: TOML file, validation, and load-path safety.
//!
//! The file has `display`, `video`, `audio`, `network`, and `logging`
//! sections. Out-of-range values are rejected at load time with the
//! offending key and its permitted range in the message. The load path is
//! restricted to the user config/data directories, `/etc/streamcast/`, and
//! `/tmp/streamcast/`; traversal sequences are rejected outright.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::control::QualityPreset;
use crate::error::{Error, Result};
use crate::pipeline::types::{HardwareAccel, VideoCodec};

/// Display-server backend choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    #[default]
    Auto,
    X11,
    Wayland,
}

/// Which audio to capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    #[default]
    System,
    Microphone,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayOptions {
    pub backend: DisplayBackend,
    /// Monitor id; -1 selects the primary.
    pub monitor: i32,
    pub show_cursor: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self { backend: DisplayBackend::Auto, monitor: -1, show_cursor: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    pub codec: VideoCodec,
    /// Bits per second; 0 means auto.
    pub bitrate: u32,
    pub fps: u32,
    pub quality: QualityPreset,
    pub hw_accel: HardwareAccel,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            bitrate: 0,
            fps: 60,
            quality: QualityPreset::Auto,
            hw_accel: HardwareAccel::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioOptions {
    pub enabled: bool,
    pub source: AudioSource,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self { enabled: true, source: AudioSource::System }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub bind_address: String,
    /// 0 means auto-assign.
    pub port: u16,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub verbose: bool,
}

/// Full configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub display: DisplayOptions,
    pub video: VideoOptions,
    pub audio: AudioOptions,
    pub network: NetworkOptions,
    pub logging: LoggingOptions,
}

impl Options {
    /// Range checks; messages name the key and its permitted range.
    pub fn validate(&self) -> Result<()> {
        if !(-1..=255).contains(&self.display.monitor) {
            return Err(Error::config(format!(
                "display.monitor out of range (-1 to 255): {}",
                self.display.monitor
            )));
        }
        if !(1..=240).contains(&self.video.fps) {
            return Err(Error::config(format!(
                "video.fps out of range (1 to 240): {}",
                self.video.fps
            )));
        }
        if self.video.bitrate != 0 && !(100_000..=100_000_000).contains(&self.video.bitrate) {
            return Err(Error::config(format!(
                "video.bitrate out of range (100000 to 100000000, or 0 for auto): {}",
                self.video.bitrate
            )));
        }
        if self.network.port != 0 && self.network.port < 1024 {
            return Err(Error::config(format!(
                "network.port out of range (1024 to 65535, or 0 for auto): {}",
                self.network.port
            )));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| Error::config(err.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let options: Options =
            toml::from_str(text).map_err(|err| Error::config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load from `path`, or from the default location when `None`. A
    /// missing file yields defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => validate_config_path(p)?,
            None => default_config_path(),
        };
        if !path.exists() {
            return Ok(Options::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let path = match path {
            Some(p) => validate_config_path(p)?,
            None => default_config_path(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| Error::config(format!("cannot create {}: {err}", parent.display())))?;
        }
        std::fs::write(&path, self.to_toml()?)
            .map_err(|err| Error::config(format!("cannot write {}: {err}", path.display())))
    }
}

/// Default path: $XDG_CONFIG_HOME/streamcast/config.toml, falling back to
/// ~/.config and finally /etc.
pub fn default_config_path() -> PathBuf {
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    config_dir.join("streamcast").join("config.toml")
}

/// Restrict a user-supplied config path to the allowed directories.
///
/// `..` sequences are rejected before any other inspection; a leading `~/`
/// expands to `$HOME`. Allowed roots: `$HOME/.config/`, `$HOME/.local/`,
/// `/etc/streamcast/`, `/tmp/streamcast/`.
pub fn validate_config_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::config("config path is empty"));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(Error::config(format!(
            "config path must not contain '..' sequences: {path}"
        )));
    }

    let home = env::var("HOME").ok();
    let expanded = if let Some(rest) = path.strip_prefix("~/") {
        let Some(home) = &home else {
            return Err(Error::config("cannot expand '~': HOME is not set"));
        };
        format!("{home}/{rest}")
    } else {
        path.to_string()
    };

    let mut allowed: Vec<String> = Vec::new();
    if let Some(home) = &home {
        allowed.push(format!("{home}/.config/"));
        allowed.push(format!("{home}/.local/"));
    }
    allowed.push("/etc/streamcast/".to_string());
    allowed.push("/tmp/streamcast/".to_string());

    if allowed.iter().any(|prefix| expanded.starts_with(prefix.as_str())) {
        Ok(PathBuf::from(expanded))
    } else {
        Err(Error::config(format!(
            "config path must be under the user config directory, /etc/streamcast/, or /tmp/streamcast/: {path}"
        )))
    }
}
