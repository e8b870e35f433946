//! Engine configuration loading.
//!
//! Every tunable has a default, so a missing file (or a partial one) yields a
//! working engine. Paths resolve under `~/.proctor` unless `PROCTOR_HOME` is set.

use crate::error::{ProctorError, Result};
use proctor_daemon_protocol::AlertKind;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOME_ENV: &str = "PROCTOR_HOME";
const ENGINE_CONFIG_FILE: &str = "engine.toml";

pub const DEFAULT_VISUAL_TICK_MS: u64 = 700;
pub const DEFAULT_AUDIO_SAMPLE_MS: u64 = 200;
pub const DEFAULT_AUDIO_CHUNK_MS: u64 = 5_000;

/// Returns the data root (`$PROCTOR_HOME` or `~/.proctor`).
pub fn proctor_home() -> Option<PathBuf> {
    if let Ok(value) = env::var(HOME_ENV) {
        if !value.trim().is_empty() {
            return Some(PathBuf::from(value));
        }
    }
    dirs::home_dir().map(|home| home.join(".proctor"))
}

pub fn default_config_path() -> Option<PathBuf> {
    proctor_home().map(|root| root.join(ENGINE_CONFIG_FILE))
}

/// Loads the engine config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(EngineConfig::default()),
        },
    };

    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| ProctorError::Io {
        context: format!("reading {}", config_path.display()),
        source: err,
    })?;
    let config = toml::from_str::<EngineConfig>(&content).map_err(|err| ProctorError::Config {
        path: config_path.clone(),
        details: err.to_string(),
    })?;
    config.validate().map_err(|details| ProctorError::Config {
        path: config_path,
        details,
    })?;
    Ok(config)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity sent to the session store on start; generated when absent.
    pub client_id: Option<String>,
    pub visual: VisualConfig,
    pub face: FaceConfig,
    pub object: ObjectConfig,
    pub audio: AudioConfig,
    pub focus: FocusConfig,
    pub evidence: EvidencePolicy,
    pub delivery: DeliveryConfig,
    pub feed: FeedConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.visual.tick_interval_ms == 0 {
            return Err("visual.tick_interval_ms must be greater than zero".to_string());
        }
        if self.audio.sample_interval_ms == 0 {
            return Err("audio.sample_interval_ms must be greater than zero".to_string());
        }
        if self.audio.required_consecutive == 0 {
            return Err("audio.required_consecutive must be at least 1".to_string());
        }
        if self.delivery.max_attempts == 0 {
            return Err("delivery.max_attempts must be at least 1".to_string());
        }
        if self.feed.capacity == 0 {
            return Err("feed.capacity must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.face.min_confidence) {
            return Err("face.min_confidence must be within 0.0..=1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.object.min_score) {
            return Err("object.min_score must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    pub tick_interval_ms: u64,
}

impl VisualConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_VISUAL_TICK_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    /// Regions below this confidence are not counted as faces.
    pub min_confidence: f32,
    pub no_face_confirm_ms: u64,
    pub no_face_cooldown_ms: u64,
    pub multiple_faces_confirm_ms: u64,
    pub multiple_faces_cooldown_ms: u64,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.45,
            no_face_confirm_ms: 4_000,
            no_face_cooldown_ms: 0,
            multiple_faces_confirm_ms: 1_200,
            multiple_faces_cooldown_ms: 0,
        }
    }
}

/// How the suspicious-object channel decides that a condition "persisted".
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectPersistence {
    /// Any suspicious class present on every tick of the confirm window.
    AnySuspicious,
    /// The top suspicious class must stay the same across the confirm window.
    SameClass,
}

impl Default for ObjectPersistence {
    fn default() -> Self {
        Self::AnySuspicious
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    pub enabled: bool,
    pub min_score: f32,
    /// Lower-case fragments; a label is suspicious when it contains any of them.
    pub suspicious_labels: Vec<String>,
    pub confirm_ms: u64,
    pub cooldown_ms: u64,
    pub persistence: ObjectPersistence,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_score: 0.40,
            suspicious_labels: [
                "cell phone",
                "cellphone",
                "mobile phone",
                "phone",
                "book",
                "laptop",
                "tv",
                "monitor",
                "tablet",
            ]
            .iter()
            .map(|label| label.to_string())
            .collect(),
            confirm_ms: 1_000,
            cooldown_ms: 4_000,
            persistence: ObjectPersistence::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    pub rms_threshold: f32,
    pub required_consecutive: u32,
    pub cooldown_ms: u64,
    /// Cadence for standalone audio evidence chunks (0 disables).
    pub chunk_interval_ms: u64,
}

impl AudioConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: DEFAULT_AUDIO_SAMPLE_MS,
            rms_threshold: 0.06,
            required_consecutive: 3,
            cooldown_ms: 10_000,
            chunk_interval_ms: DEFAULT_AUDIO_CHUNK_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub cooldown_ms: u64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self { cooldown_ms: 5_000 }
    }
}

/// Whether a frame is captured as evidence when a kind is confirmed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidencePolicy {
    pub no_face: bool,
    pub multiple_faces: bool,
    pub suspicious_object: bool,
    pub audio_activity: bool,
    pub tab_switch: bool,
    pub manual_test: bool,
}

impl EvidencePolicy {
    pub fn captures(&self, kind: AlertKind) -> bool {
        match kind {
            AlertKind::NoFace => self.no_face,
            AlertKind::MultipleFaces => self.multiple_faces,
            AlertKind::SuspiciousObject => self.suspicious_object,
            AlertKind::AudioActivity => self.audio_activity,
            AlertKind::TabSwitch => self.tab_switch,
            AlertKind::ManualTest => self.manual_test,
        }
    }
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            no_face: true,
            multiple_faces: true,
            suspicious_object: true,
            audio_activity: false,
            tab_switch: false,
            manual_test: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 2_000,
            flush_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}
