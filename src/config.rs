//! Configuration management for tts-announcer.
//!
//! Loads config from a YAML file in standard locations, then layers
//! `TTS_<SECTION>_<KEY>` environment variables and CLI flags on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

const LOG_LEVELS: [&str; 5] = ["critical", "error", "warning", "info", "debug"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub base_topic: String,
    pub heartbeat: bool,
    pub heartbeat_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8768,
            username: String::new(),
            password: String::new(),
            base_topic: "tts".into(),
            heartbeat: true,
            heartbeat_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub disable: bool,
    pub device: Option<String>,
    pub player: PathBuf,
    pub sounds_path: PathBuf,
    pub temp_path: PathBuf,
    pub keep_file: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            disable: false,
            device: None,
            player: PathBuf::from("/usr/bin/paplay"),
            sounds_path: PathBuf::from("/app/sounds"),
            temp_path: PathBuf::from("/tmp"),
            keep_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub lang: String,
    pub tld: String,
    pub slow: bool,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            lang: "de".into(),
            tld: "de".into(),
            slow: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub queue_capacity: usize,
    pub producer_timeout_secs: f64,
    pub max_producers: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            producer_timeout_secs: 5.0,
            max_producers: 4,
        }
    }
}

impl PlaybackConfig {
    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.producer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            color: false,
        }
    }
}

impl LogConfig {
    /// Level name understood by `tracing_subscriber::EnvFilter`.
    pub fn filter_level(&self) -> &str {
        match self.level.as_str() {
            "critical" | "error" => "error",
            "warning" => "warn",
            "debug" => "debug",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub tts: TtsConfig,
    pub playback: PlaybackConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/tts-announcer/config.yaml
    /// 3. /etc/tts-announcer/config.yaml
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join(DEFAULT_CONFIG_FILE)),
                dirs::home_dir().map(|h| h.join(".config/tts-announcer/config.yaml")),
                Some(PathBuf::from("/etc/tts-announcer/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Ok(Self::default());
        };

        if !config_path.exists() {
            info!("No configuration file at {}, skipping", config_path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)
            .map_err(|e| format!("Failed to read {}: {e}", config_path.display()))?;
        let config: Self = serde_yml::from_str(&contents)
            .map_err(|e| format!("In configuration file {}: {e}", config_path.display()))?;
        info!("Loaded config from {}", config_path.display());
        Ok(config)
    }

    /// Write a default configuration to `path` for the user to edit.
    pub fn write_example(path: &Path) -> Result<(), String> {
        let yaml = serde_yml::to_string(&Self::default())
            .map_err(|e| format!("Could not serialize configuration: {e}"))?;
        std::fs::write(path, yaml).map_err(|e| format!("Could not save configuration: {e}"))
    }

    /// Apply every `TTS_*` variable from `vars`. Unknown keys are rejected.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix("TTS_") else {
                continue;
            };
            self.set(&key.to_ascii_lowercase(), &value)
                .map_err(|e| format!("Invalid env parameter {name}: {e}"))?;
        }
        Ok(())
    }

    /// Set one flattened `section_key` value from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "server_host" => self.server.host = value.to_string(),
            "server_port" => self.server.port = parse(value)?,
            "server_username" => self.server.username = value.to_string(),
            "server_password" => self.server.password = value.to_string(),
            "server_base_topic" => self.server.base_topic = value.to_string(),
            "server_heartbeat" => self.server.heartbeat = parse_bool(value)?,
            "server_heartbeat_interval" => self.server.heartbeat_interval = parse(value)?,
            "audio_disable" => self.audio.disable = parse_bool(value)?,
            "audio_device" => self.audio.device = Some(value.to_string()),
            "audio_player" => self.audio.player = PathBuf::from(value),
            "audio_sounds_path" => self.audio.sounds_path = PathBuf::from(value),
            "audio_temp_path" => self.audio.temp_path = PathBuf::from(value),
            "audio_keep_file" => self.audio.keep_file = parse_bool(value)?,
            "tts_lang" => self.tts.lang = value.to_string(),
            "tts_tld" => self.tts.tld = value.to_string(),
            "tts_slow" => self.tts.slow = parse_bool(value)?,
            "playback_queue_capacity" => self.playback.queue_capacity = parse(value)?,
            "playback_producer_timeout_secs" => {
                self.playback.producer_timeout_secs = parse(value)?
            }
            "playback_max_producers" => self.playback.max_producers = parse(value)?,
            "log_level" => self.log.level = value.to_ascii_lowercase(),
            "log_color" => self.log.color = parse_bool(value)?,
            _ => return Err(format!("unknown key '{key}'")),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be between 1 and 65535".into());
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(format!(
                "log.level '{}' is not one of {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            ));
        }
        if self.playback.queue_capacity == 0 {
            return Err("playback.queue_capacity must be at least 1".into());
        }
        if self.playback.max_producers == 0 {
            return Err("playback.max_producers must be at least 1".into());
        }
        if !self.playback.producer_timeout_secs.is_finite()
            || self.playback.producer_timeout_secs < 0.0
        {
            return Err("playback.producer_timeout_secs must be a non-negative number".into());
        }
        if self.server.heartbeat_interval == 0 {
            return Err("server.heartbeat_interval must be at least 1".into());
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| format!("'{value}': {e}"))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}
