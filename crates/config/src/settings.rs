//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Development mode - relaxed validation, warnings only
    #[default]
    Development,
    /// Staging mode - stricter validation
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if strict validation should be applied
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Runtime environment (development, staging, production)
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Remote command connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Cloud text-to-speech provider
    #[serde(default)]
    pub cloud_tts: CloudTtsConfig,

    /// Speech selection and local engine
    #[serde(default)]
    pub speech: SpeechConfig,

    /// Circuit breaker around the cloud provider
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry policy for cloud synthesis
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub lip_sync: LipSyncConfig,

    #[serde(default)]
    pub subtitles: SubtitleConfig,

    #[serde(default)]
    pub presentation: PresentationConfig,

    /// Clip catalog sources
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint; no connection is attempted when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Reconnects scheduled after the last successful open
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_reconnect_jitter_ms")]
    pub jitter_ms: u64,

    /// Outbound frames buffered while the writer is busy
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter_ms() -> u64 {
    1000
}

fn default_outbound_buffer() -> usize {
    64
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            jitter_ms: default_reconnect_jitter_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Cloud text-to-speech configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudTtsConfig {
    /// API key; falls back to `ELEVENLABS_API_KEY`
    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub voice_id: Option<String>,

    #[serde(default = "default_model_id")]
    pub model_id: String,

    #[serde(default = "default_cloud_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_cloud_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_stability")]
    pub stability: f32,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
}

fn default_api_key() -> Option<String> {
    std::env::var("ELEVENLABS_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}

fn default_cloud_endpoint() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_cloud_timeout_ms() -> u64 {
    30_000
}

fn default_stability() -> f32 {
    0.5
}

fn default_similarity_boost() -> f32 {
    0.75
}

impl Default for CloudTtsConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            voice_id: None,
            model_id: default_model_id(),
            endpoint: default_cloud_endpoint(),
            timeout_ms: default_cloud_timeout_ms(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
        }
    }
}

impl CloudTtsConfig {
    /// Both credentials and a voice are required
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.api_key) && present(&self.voice_id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Which text-to-speech backend is tried first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreferredProvider {
    #[default]
    Cloud,
    Local,
}

/// Speech selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Use the local engine when the cloud provider is skipped or fails
    #[serde(default = "default_true")]
    pub local_fallback_enabled: bool,

    #[serde(default)]
    pub preferred_provider: PreferredProvider,

    /// Local voice name, engine default when unset
    #[serde(default)]
    pub local_voice: Option<String>,

    /// Speaking rate estimate used to place free-text pauses
    #[serde(default = "default_ms_per_char")]
    pub ms_per_char: u64,

    /// How long a submitted utterance may stay silent before a nudge
    #[serde(default = "default_local_start_deadline_ms")]
    pub local_start_deadline_ms: u64,

    #[serde(default = "default_local_max_nudges")]
    pub local_max_nudges: u32,

    /// Output volume in [0, 1]
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_true() -> bool {
    true
}

fn default_ms_per_char() -> u64 {
    70
}

fn default_local_start_deadline_ms() -> u64 {
    500
}

fn default_local_max_nudges() -> u32 {
    2
}

fn default_volume() -> f32 {
    1.0
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            local_fallback_enabled: true,
            preferred_provider: PreferredProvider::default(),
            local_voice: None,
            ms_per_char: default_ms_per_char(),
            local_start_deadline_ms: default_local_start_deadline_ms(),
            local_max_nudges: default_local_max_nudges(),
            volume: default_volume(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_attempts() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_ms() -> u64 {
    5000
}

fn default_retry_jitter_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            jitter_ms: default_retry_jitter_ms(),
        }
    }
}

/// Lip-sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LipSyncConfig {
    #[serde(default = "default_lip_sync_tick_ms")]
    pub tick_ms: u64,

    /// Mouth stays closed this long at each pause offset
    #[serde(default = "default_pause_duration_ms")]
    pub pause_duration_ms: u64,

    /// Number of open mouth shapes (closed is 0)
    #[serde(default = "default_shape_count")]
    pub shape_count: u8,
}

fn default_lip_sync_tick_ms() -> u64 {
    90
}

fn default_pause_duration_ms() -> u64 {
    500
}

fn default_shape_count() -> u8 {
    8
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_lip_sync_tick_ms(),
            pause_duration_ms: default_pause_duration_ms(),
            shape_count: default_shape_count(),
        }
    }
}

/// Subtitle (karaoke) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleConfig {
    #[serde(default = "default_subtitle_tick_ms")]
    pub tick_ms: u64,
}

fn default_subtitle_tick_ms() -> u64 {
    50
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_subtitle_tick_ms(),
        }
    }
}

/// Presentation mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationConfig {
    /// Clip that reveals the avatar
    #[serde(default = "default_start_id")]
    pub start_id: String,

    /// Clip after which the avatar is hidden
    #[serde(default = "default_end_id")]
    pub end_id: String,
}

fn default_start_id() -> String {
    "intro_1".to_string()
}

fn default_end_id() -> String {
    "despedida_1".to_string()
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            start_id: default_start_id(),
            end_id: default_end_id(),
        }
    }
}

/// Catalog sources
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    /// External catalog document; the built-in catalog is used when unset
    /// or invalid
    #[serde(default)]
    pub path: Option<String>,

    /// Per-entry edits merged over the loaded catalog
    #[serde(default)]
    pub overrides_path: Option<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_connection()?;
        self.validate_resilience()?;
        self.validate_speech()?;
        self.validate_timing()?;
        Ok(())
    }

    fn validate_connection(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;

        if conn.base_delay_ms == 0 {
            return Err(invalid("connection.base_delay_ms", "Must be at least 1"));
        }
        if conn.base_delay_ms > conn.max_delay_ms {
            return Err(invalid(
                "connection.base_delay_ms",
                format!("Cannot exceed max_delay_ms ({})", conn.max_delay_ms),
            ));
        }
        if conn.outbound_buffer == 0 {
            return Err(invalid("connection.outbound_buffer", "Must be at least 1"));
        }

        match &conn.endpoint {
            Some(endpoint) if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") => {
                return Err(invalid(
                    "connection.endpoint",
                    format!("Expected a ws:// or wss:// URL, got {endpoint}"),
                ));
            }
            None if self.environment.is_strict() => {
                return Err(ConfigError::MissingField("connection.endpoint".to_string()));
            }
            None => {
                tracing::warn!("connection.endpoint is not set, remote commands are disabled");
            }
            _ => {}
        }

        Ok(())
    }

    fn validate_resilience(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "Must be at least 1"));
        }
        if self.breaker.half_open_max_attempts == 0 {
            return Err(invalid("breaker.half_open_max_attempts", "Must be at least 1"));
        }
        if self.breaker.reset_timeout_ms == 0 {
            return Err(invalid("breaker.reset_timeout_ms", "Must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "Must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                format!("Cannot exceed max_delay_ms ({})", self.retry.max_delay_ms),
            ));
        }

        Ok(())
    }

    fn validate_speech(&self) -> Result<(), ConfigError> {
        let speech = &self.speech;

        if !(0.0..=1.0).contains(&speech.volume) {
            return Err(invalid(
                "speech.volume",
                format!("Must be between 0.0 and 1.0, got {}", speech.volume),
            ));
        }
        if speech.local_start_deadline_ms == 0 {
            return Err(invalid("speech.local_start_deadline_ms", "Must be at least 1"));
        }

        for (field, value) in [
            ("cloud_tts.stability", self.cloud_tts.stability),
            ("cloud_tts.similarity_boost", self.cloud_tts.similarity_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(
                    field,
                    format!("Must be between 0.0 and 1.0, got {value}"),
                ));
            }
        }

        if speech.preferred_provider == PreferredProvider::Cloud && !self.cloud_tts.is_configured()
        {
            if self.environment.is_production() && !speech.local_fallback_enabled {
                return Err(ConfigError::MissingField(
                    "cloud_tts.api_key / cloud_tts.voice_id".to_string(),
                ));
            }
            tracing::warn!("Cloud speech is preferred but not configured, local speech only");
        }

        Ok(())
    }

    fn validate_timing(&self) -> Result<(), ConfigError> {
        if self.lip_sync.tick_ms == 0 {
            return Err(invalid("lip_sync.tick_ms", "Must be at least 1"));
        }
        if self.lip_sync.shape_count < 2 {
            return Err(invalid(
                "lip_sync.shape_count",
                "Need at least 2 open shapes to alternate",
            ));
        }
        if self.subtitles.tick_ms == 0 {
            return Err(invalid("subtitles.tick_ms", "Must be at least 1"));
        }
        Ok(())
    }
}

/// Load settings from files and environment
///
/// Priority: `AVATAR__*` env vars > `config/{env}` > `config/default` > defaults
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("AVATAR")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

/// Load settings from a single file, then environment
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix("AVATAR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.connection.max_reconnect_attempts, 10);
        assert_eq!(settings.breaker.failure_threshold, 3);
        assert_eq!(settings.breaker.reset_timeout_ms, 60_000);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.lip_sync.tick_ms, 90);
        assert_eq!(settings.lip_sync.pause_duration_ms, 500);
        assert_eq!(settings.subtitles.tick_ms, 50);
        assert_eq!(settings.presentation.start_id, "intro_1");
        assert!(settings.speech.local_fallback_enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_volume_validation() {
        let mut settings = Settings::default();
        settings.speech.volume = 1.5;
        assert!(settings.validate().is_err());

        settings.speech.volume = 0.0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_delay_ordering_validation() {
        let mut settings = Settings::default();
        settings.retry.base_delay_ms = 10_000;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "retry.base_delay_ms"
        ));

        let mut settings = Settings::default();
        settings.connection.base_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut settings = Settings::default();
        settings.breaker.failure_threshold = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.lip_sync.tick_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_endpoint_scheme_validation() {
        let mut settings = Settings::default();
        settings.connection.endpoint = Some("http://example.com".into());
        assert!(settings.validate().is_err());

        settings.connection.endpoint = Some("wss://example.com/ws".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_strict_environment_requires_endpoint() {
        let mut settings = Settings::default();
        settings.environment = RuntimeEnvironment::Staging;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_cloud_configured() {
        let mut cloud = CloudTtsConfig {
            api_key: Some("key".into()),
            ..CloudTtsConfig::default()
        };
        assert!(!cloud.is_configured());
        cloud.voice_id = Some("voice".into());
        assert!(cloud.is_configured());
        cloud.api_key = Some("  ".into());
        assert!(!cloud.is_configured());
    }

    #[test]
    fn test_load_settings_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[connection]
endpoint = "ws://localhost:9000/ws"
max_reconnect_attempts = 4

[speech]
preferred_provider = "local"
volume = 0.5

[lip_sync]
tick_ms = 120
"#
        )
        .unwrap();

        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(
            settings.connection.endpoint.as_deref(),
            Some("ws://localhost:9000/ws")
        );
        assert_eq!(settings.connection.max_reconnect_attempts, 4);
        assert_eq!(settings.connection.base_delay_ms, 1000);
        assert_eq!(settings.speech.preferred_provider, PreferredProvider::Local);
        assert_eq!(settings.speech.volume, 0.5);
        assert_eq!(settings.lip_sync.tick_ms, 120);
        assert_eq!(settings.lip_sync.pause_duration_ms, 500);
    }

    #[test]
    fn test_load_settings_missing_file() {
        let result = load_settings_from(std::path::Path::new("/nonexistent/avatar.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
