use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct QclassConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Keys left out of `[cache]` keep their default values.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub sliding_ttl: bool,
    pub purge_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_seconds: 60,
            sliding_ttl: false,
            purge_interval_seconds: 30,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictorConfig {
    /// "http", "onnx" or "static"
    pub backend: String,
    pub url: String,
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub model_path: String,
    pub max_length: usize,
    pub threshold: f64,
    pub labels: Vec<String>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            backend: "http".to_string(),
            url: "http://127.0.0.1:9000/predict".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 500,
            model_path: String::new(),
            max_length: 128,
            threshold: 0.7,
            labels: vec!["SIMPLE".to_string(), "COMPLEX".to_string()],
        }
    }
}

impl PredictorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl QclassConfig {
    /// Load from a TOML file, then apply `QCLASS_SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("QCLASS").separator("__"))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Message("cache.capacity must be > 0".to_string()));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(ConfigError::Message("cache.ttl_seconds must be > 0".to_string()));
        }
        if self.predictor.timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "predictor.timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.predictor.labels.len() != 2 {
            return Err(ConfigError::Message(
                "predictor.labels must name exactly two classes".to_string(),
            ));
        }
        Ok(())
    }
}
