//! Environment-driven configuration.
//!
//! All knobs come from the process environment (a `.env` file is honored at
//! startup). Missing optional values fall back to the documented defaults.

use std::env;
use std::time::Duration;

const ENV_PORT: &str = "PORT";
const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_REDIS_URL: &str = "REDIS_URL";
const ENV_QUEUE_CONCURRENCY: &str = "QUEUE_CONCURRENCY";
const ENV_MAX_RETRIES: &str = "MAX_RETRIES";
const ENV_MOCK_SEED: &str = "MOCK_SEED";
const ENV_RATE_LIMIT: &str = "RATE_LIMIT";
const ENV_PING_INTERVAL: &str = "PING_INTERVAL";
const ENV_PONG_TIMEOUT: &str = "PONG_TIMEOUT";

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_QUEUE_CONCURRENCY: usize = 10;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RATE_LIMIT: u32 = 30;
const DEFAULT_PING_INTERVAL_MS: u64 = 20_000;
const DEFAULT_PONG_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Recognized for deployment parity; this build keeps the queue and the
    /// ephemeral stores in the database / in process.
    pub redis_url: Option<String>,
    pub queue_concurrency: usize,
    pub max_retries: u32,
    pub mock_seed: Option<u64>,
    pub rate_limit: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: parse_env(ENV_PORT, DEFAULT_PORT),
            database_url: env::var(ENV_DATABASE_URL).expect("DATABASE_URL must be set"),
            redis_url: env::var(ENV_REDIS_URL).ok(),
            queue_concurrency: parse_env(ENV_QUEUE_CONCURRENCY, DEFAULT_QUEUE_CONCURRENCY),
            max_retries: parse_env(ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES),
            mock_seed: env::var(ENV_MOCK_SEED).ok().and_then(|s| s.parse().ok()),
            rate_limit: parse_env(ENV_RATE_LIMIT, DEFAULT_RATE_LIMIT),
            ping_interval: Duration::from_millis(parse_env(
                ENV_PING_INTERVAL,
                DEFAULT_PING_INTERVAL_MS,
            )),
            pong_timeout: Duration::from_millis(parse_env(
                ENV_PONG_TIMEOUT,
                DEFAULT_PONG_TIMEOUT_MS,
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: String::new(),
            redis_url: None,
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            mock_seed: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            pong_timeout: Duration::from_millis(DEFAULT_PONG_TIMEOUT_MS),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
