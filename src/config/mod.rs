mod settings;

pub use settings::{
    ApiConfig, CallbackApiConfig, CallbackAuthConfig, CallbackAuthType, ChannelConfig,
    DispatchConfig, EventsConfig, LogFormat, LoggingConfig, OtelConfig, RedisConfig, ServerConfig, Settings,
};
