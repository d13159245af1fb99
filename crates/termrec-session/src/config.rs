//! Configuration: `~/.termrec/config.toml` plus CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use termrec_core::{TermrecError, TermrecResult};
use tracing::info;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.termrec/config.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub replay: ReplaySection,
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// `[recording]` section: defaults for new recordings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingSection {
    #[serde(default)]
    pub capture_input: bool,
    #[serde(default)]
    pub encrypt: bool,
}

/// `[replay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySection {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default = "default_readahead")]
    pub readahead: usize,
    #[serde(default = "default_speed")]
    pub default_speed: f64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            command_buffer: default_command_buffer(),
            readahead: default_readahead(),
            default_speed: default_speed(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.termrec".to_string()
}
fn default_progress_interval_ms() -> u64 {
    250
}
fn default_command_buffer() -> usize {
    8
}
fn default_readahead() -> usize {
    64
}
fn default_speed() -> f64 {
    1.0
}

/// Replay tuning, resolved from `[replay]`.
#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    pub progress_interval: Duration,
    pub command_buffer: usize,
    pub readahead: usize,
    pub default_speed: f64,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        ReplaySection::default().into()
    }
}

impl From<ReplaySection> for ReplaySettings {
    fn from(s: ReplaySection) -> Self {
        Self {
            progress_interval: Duration::from_millis(s.progress_interval_ms.max(1)),
            command_buffer: s.command_buffer.max(1),
            readahead: s.readahead.max(1),
            default_speed: s.default_speed,
        }
    }
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub capture_input: bool,
    pub encrypt: bool,
    pub replay: ReplaySettings,
}

impl Config {
    /// Load the config file (if present), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli_data_dir: Option<&Path>) -> TermrecResult<Self> {
        let path = config_path
            .map(expand_tilde)
            .unwrap_or_else(|| expand_tilde_str(DEFAULT_CONFIG_PATH));

        let file = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            parse(&content)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };

        Self::resolve(file, cli_data_dir)
    }

    /// Defaults rooted at `data_dir`. Handy for tests and embedding.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            capture_input: false,
            encrypt: false,
            replay: ReplaySettings::default(),
        }
    }

    fn resolve(file: ConfigFile, cli_data_dir: Option<&Path>) -> TermrecResult<Self> {
        let speed = file.replay.default_speed;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(TermrecError::Config(format!(
                "replay.default_speed must be a positive number, got {speed}"
            )));
        }

        let data_dir = cli_data_dir
            .map(expand_tilde)
            .unwrap_or_else(|| expand_tilde_str(&file.storage.data_dir));

        Ok(Self {
            data_dir,
            capture_input: file.recording.capture_input,
            encrypt: file.recording.encrypt,
            replay: file.replay.into(),
        })
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("termrec.log")
    }
}

fn parse(content: &str) -> TermrecResult<ConfigFile> {
    toml::from_str(content).map_err(|e| TermrecError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(s)
}
