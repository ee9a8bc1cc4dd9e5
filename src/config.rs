use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    artwork::{
        store::{DefaultArtwork, DefaultImageError},
        transcode::{ResizeMode, TranscodeSettings, Transcoder},
    },
    domain::event::EventKind,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    DefaultImage(#[from] DefaultImageError),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub image: ImageConfig,
    pub http: HttpConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub mqtt: Option<MqttConfig>,
    pub device: Option<DeviceConfig>,
    pub esphome: Option<EspHomeConfig>,
}

/// The one feed the pipeline listens to.
#[derive(Debug, Clone, Copy)]
pub enum SourceConfig<'a> {
    Mqtt(&'a MqttConfig),
    Device(&'a DeviceConfig),
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source()?;

        let image = &self.image;
        if image.width == 0 || image.height == 0 {
            return Err(invalid("image width and height must be positive"));
        }
        if !(1..=100).contains(&image.jpeg_quality) {
            return Err(invalid("image.jpeg_quality must be between 1 and 100"));
        }
        if self.pipeline.event_queue_depth == 0 {
            return Err(invalid("pipeline.event_queue_depth must be positive"));
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.topic_prefix.trim_matches('/').is_empty() {
                return Err(invalid("mqtt.topic_prefix must not be empty"));
            }
        }
        if let Some(device) = &self.device {
            if device.name.trim().is_empty() {
                return Err(invalid("device.name must not be empty"));
            }
            if device.poll_interval_ms == 0
                || device.discovery_timeout_ms == 0
                || device.request_timeout_ms == 0
            {
                return Err(invalid(
                    "device.poll_interval_ms, discovery_timeout_ms and request_timeout_ms must be positive",
                ));
            }
        }
        if let Some(esphome) = &self.esphome {
            if esphome.max_attempts == 0 || esphome.queue_depth == 0 {
                return Err(invalid(
                    "esphome.max_attempts and esphome.queue_depth must be positive",
                ));
            }
            if esphome.call_timeout_ms == 0 || esphome.keepalive_secs == 0 {
                return Err(invalid(
                    "esphome.call_timeout_ms and esphome.keepalive_secs must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Transcodes the configured fallback images.
    pub fn load_defaults(&self, transcoder: &Transcoder) -> Result<DefaultArtwork, ConfigError> {
        Ok(DefaultArtwork::load(
            transcoder,
            &self.image.default_jpeg,
            &self.image.default_png,
        )?)
    }

    pub fn source(&self) -> Result<SourceConfig<'_>, ConfigError> {
        match (&self.mqtt, &self.device) {
            (Some(mqtt), None) => Ok(SourceConfig::Mqtt(mqtt)),
            (None, Some(device)) => Ok(SourceConfig::Device(device)),
            (Some(_), Some(_)) => Err(invalid(
                "both [mqtt] and [device] sources are configured, use only one",
            )),
            (None, None) => Err(invalid("no source configured, add an [mqtt] or [device] section")),
        }
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid(reason.to_string())
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub resize: ResizeMode,
    pub default_jpeg: PathBuf,
    pub default_png: PathBuf,
}

impl ImageConfig {
    pub fn transcode_settings(&self) -> TranscodeSettings {
        TranscodeSettings {
            width: self.width,
            height: self.height,
            jpeg_quality: self.jpeg_quality,
            resize: self.resize,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub port: u16,
    #[serde(default = "default_jpeg_path")]
    pub jpeg_path: String,
    #[serde(default = "default_png_path")]
    pub png_path: String,
    #[serde(default = "default_default_jpeg_path")]
    pub default_jpeg_path: String,
    #[serde(default = "default_default_png_path")]
    pub default_png_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    #[serde(default = "default_cover_topic")]
    pub cover_topic: String,
    #[serde(default = "default_title_topic")]
    pub title_topic: String,
    #[serde(default = "default_artist_topic")]
    pub artist_topic: String,
    #[serde(default = "default_album_topic")]
    pub album_topic: String,
    pub availability_topic: Option<String>,
    #[serde(default = "default_payload_available")]
    pub payload_available: String,
    #[serde(default = "default_payload_not_available")]
    pub payload_not_available: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Largest accepted publish; cover art easily exceeds MQTT client defaults.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_now_playing_path")]
    pub now_playing_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EspHomeConfig {
    pub host: String,
    #[serde(default = "default_esphome_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub actions: Actions,
}

impl EspHomeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Remote action per notification kind; a missing entry disables that kind.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Actions {
    pub artwork_changed: Option<String>,
    pub title_changed: Option<String>,
    pub artist_changed: Option<String>,
    pub album_changed: Option<String>,
}

impl Actions {
    pub fn action_for(&self, kind: EventKind) -> Option<&str> {
        let action = match kind {
            EventKind::ArtworkChanged => &self.artwork_changed,
            EventKind::TitleChanged => &self.title_changed,
            EventKind::ArtistChanged => &self.artist_changed,
            EventKind::AlbumChanged => &self.album_changed,
        };
        action.as_deref().filter(|name| !name.trim().is_empty())
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_jpeg_path() -> String {
    "/cover.jpg".into()
}
fn default_png_path() -> String {
    "/cover.png".into()
}
fn default_default_jpeg_path() -> String {
    "/default.jpg".into()
}
fn default_default_png_path() -> String {
    "/default.png".into()
}
fn default_event_queue_depth() -> usize {
    32
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "coverbridge".into()
}
fn default_cover_topic() -> String {
    "cover".into()
}
fn default_title_topic() -> String {
    "title".into()
}
fn default_artist_topic() -> String {
    "artist".into()
}
fn default_album_topic() -> String {
    "album".into()
}
fn default_payload_available() -> String {
    "online".into()
}
fn default_payload_not_available() -> String {
    "offline".into()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_max_payload_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_reconnect_max_secs() -> u64 {
    30
}
fn default_service_type() -> String {
    "_nowplaying._tcp.local.".into()
}
fn default_now_playing_path() -> String {
    "/now_playing".into()
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_discovery_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_esphome_port() -> u16 {
    6053
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_queue_depth() -> usize {
    16
}
fn default_keepalive_secs() -> u64 {
    20
}
