use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::utils::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Redis,
    Memory,
}

impl FromStr for Storage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Storage::Redis),
            "memory" => Ok(Storage::Memory),
            other => Err(format!("expected redis or memory, got {other:?}")),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub storage: Storage,
    pub redis_url: String,
    pub gateway_url: String,
    pub gateway_key_id: String,
    pub gateway_key_secret: String,
    pub currency: String,
    pub gateway_timeout: Duration,
    pub gateway_retry: RetryPolicy,
    pub pending_ttl: Duration,
    pub reap_interval: Duration,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("RUST_PORT", "1111"),
            storage: try_load("STORAGE", "redis"),
            redis_url: try_load("REDIS_URL", "redis://redis:6379"),
            gateway_url: try_load("GATEWAY_URL", "https://api.razorpay.com/v1"),
            gateway_key_id: read_secret("GATEWAY_KEY_ID"),
            gateway_key_secret: read_secret("GATEWAY_KEY_SECRET"),
            currency: try_load("CURRENCY", "INR"),
            gateway_timeout: Duration::from_millis(try_load("GATEWAY_TIMEOUT_MS", "5000")),
            gateway_retry: RetryPolicy {
                max_attempts: try_load("GATEWAY_RETRIES", "3"),
                base_delay: Duration::from_millis(try_load("GATEWAY_BACKOFF_MS", "200")),
                max_delay: Duration::from_millis(try_load("GATEWAY_BACKOFF_CAP_MS", "2000")),
            },
            pending_ttl: Duration::from_secs(try_load("PENDING_TTL_SECS", "1800")),
            reap_interval: Duration::from_secs(try_load("REAP_INTERVAL_SECS", "300")),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

pub fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn read_secret(secret_name: &str) -> String {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            warn!("Failed to read {secret_name} from file: {e}");
        })
        .expect("Secrets misconfigured!")
}
