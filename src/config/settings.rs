use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::session::{AckMode, TransportKind};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub events: EventsConfig,
    /// Required only when a channel uses the `redis` transport
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub callback_api: CallbackApiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Key required in `X-API-Key` for the publish endpoint
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Global emission flag; when false every channel is a no-op
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transport used by channels that don't name one
    #[serde(default = "default_transport")]
    pub default_transport: TransportKind,
    /// Maximum events per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a read may block waiting for events
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Known channels by name
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `events.default_transport`
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Run a dispatch worker for this channel
    #[serde(default)]
    pub consume: bool,
    /// Overrides the transport's default acknowledgment mode
    #[serde(default)]
    pub ack_mode: Option<AckMode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Must stay stable across restarts for pending entries to be redelivered
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_max_stream_length")]
    pub max_stream_length: usize,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout_ms")]
    pub circuit_breaker_reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_callback_base_url")]
    pub base_url: String,
    #[serde(default = "default_callback_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auth: CallbackAuthConfig,
}

/// Authentication scheme for outbound callback requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAuthType {
    #[default]
    None,
    ApiKey,
    Jwt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackAuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: CallbackAuthType,
    /// API key or JWT signing secret
    #[serde(default)]
    pub secret: Option<String>,
    /// Header carrying the credential; defaults depend on `type`
    #[serde(default)]
    pub header: Option<String>,
    /// JWT lifetime in milliseconds
    #[serde(default = "default_jwt_expiration_ms")]
    pub expiration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Pause after an empty read on non-blocking transports
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Handlers run concurrently within one batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
    /// Failed deliveries before an event is dead-lettered (0 = unbounded)
    #[serde(default)]
    pub max_attempts: u32,
    /// Channel receiving events that exhausted their attempts
    #[serde(default)]
    pub dead_letter_channel: Option<String>,
    /// How long shutdown waits for workers to finish their cycle
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives used when `RUST_LOG` is not set
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_transport() -> TransportKind {
    TransportKind::Memory
}

fn default_batch_size() -> usize {
    10
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_stream_prefix() -> String {
    "anchor:events:".to_string()
}

fn default_consumer_group() -> String {
    "anchor-event-relay".to_string()
}

fn default_consumer_name() -> String {
    "relay-1".to_string()
}

fn default_max_stream_length() -> usize {
    100_000
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout_ms() -> u64 {
    30_000
}

fn default_callback_base_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_callback_timeout_ms() -> u64 {
    10_000
}

fn default_jwt_expiration_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_concurrency() -> usize {
    1
}

fn default_backoff_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_max_delay_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "anchor-event-relay".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("events.enabled", true)?
            .set_default("events.default_transport", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // APP__EVENTS__ENABLED, APP__REDIS__URL, APP__CALLBACK_API__BASE_URL, ...
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Names of channels that should get a dispatch worker
    pub fn consumed_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .events
            .channels
            .iter()
            .filter(|(_, channel)| channel.consume)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl EventsConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl CallbackApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_transport: default_transport(),
            batch_size: default_batch_size(),
            read_timeout_ms: default_read_timeout_ms(),
            channels: HashMap::new(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: None,
            consume: false,
            ack_mode: None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            stream_prefix: default_stream_prefix(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
            max_stream_length: default_max_stream_length(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_ms: default_cb_reset_timeout_ms(),
        }
    }
}

impl Default for CallbackApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_callback_base_url(),
            timeout_ms: default_callback_timeout_ms(),
            auth: CallbackAuthConfig::default(),
        }
    }
}

impl Default for CallbackAuthConfig {
    fn default() -> Self {
        Self {
            auth_type: CallbackAuthType::None,
            secret: None,
            header: None,
            expiration_ms: default_jwt_expiration_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrency: default_max_concurrency(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            max_attempts: 0,
            dead_letter_channel: None,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(source: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8090);
        assert!(settings.events.enabled);
        assert_eq!(settings.events.default_transport, TransportKind::Memory);
        assert!(settings.redis.is_none());
        assert!(!settings.callback_api.enabled);
        assert_eq!(settings.dispatch.max_attempts, 0);
    }

    #[test]
    fn test_channels_from_toml() {
        let settings = from_toml(
            r#"
            [events]
            default_transport = "redis"

            [events.channels.payments]
            consume = true
            ack_mode = "per_event"

            [events.channels.audit]
            enabled = false
            transport = "memory"

            [redis]
            url = "redis://cache:6379"
            "#,
        );

        let payments = &settings.events.channels["payments"];
        assert!(payments.enabled);
        assert!(payments.consume);
        assert_eq!(payments.transport, None);
        assert_eq!(payments.ack_mode, Some(AckMode::PerEvent));

        let audit = &settings.events.channels["audit"];
        assert!(!audit.enabled);
        assert_eq!(audit.transport, Some(TransportKind::Memory));

        let redis = settings.redis.unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.consumer_group, "anchor-event-relay");
    }

    #[test]
    fn test_consumed_channels_sorted() {
        let mut settings = Settings::default();
        for (name, consume) in [("transactions", true), ("audit", false), ("quotes", true)] {
            settings.events.channels.insert(
                name.to_string(),
                ChannelConfig {
                    consume,
                    ..Default::default()
                },
            );
        }

        assert_eq!(settings.consumed_channels(), vec!["quotes", "transactions"]);
    }

    #[test]
    fn test_callback_auth_from_toml() {
        let settings = from_toml(
            r#"
            [callback_api]
            enabled = true
            base_url = "https://anchor.example.com/callbacks"

            [callback_api.auth]
            type = "jwt"
            secret = "secret"
            "#,
        );

        let callback = settings.callback_api;
        assert!(callback.enabled);
        assert_eq!(callback.timeout(), Duration::from_secs(10));
        assert_eq!(callback.auth.auth_type, CallbackAuthType::Jwt);
        assert_eq!(callback.auth.expiration_ms, 30_000);
    }
}
