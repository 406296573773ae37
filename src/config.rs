use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/* ============================= DEFAULTS ============================= */

const DEFAULT_NO_RESP_TTL_SECONDS: u64 = 5;
const DEFAULT_RESP_TTL_SECONDS: u64 = 5;
const DEFAULT_RETRY_TIMES: u32 = 4;
const DEFAULT_ECS_SERVICE_HOST: &str = "http://ecs-service:8083";
const DEFAULT_SDL_URL: &str = "redis://dbaas:6379";
const DEFAULT_HTTP_PORT: u16 = 10000;
const DEFAULT_RMR_PORT: u16 = 4562;

/* ============================= CONFIG ============================= */

/// Runtime configuration, sourced from environment variables.
///
/// Every variable is optional; malformed values fall back to the
/// default with a warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Grace window for a deleted instance when no handler has acked it.
    pub instance_delete_no_resp_ttl: Duration,

    /// Grace window for a deleted instance when at least one handler acked it.
    pub instance_delete_resp_ttl: Duration,

    /// Use the in-memory store instead of the Redis backend.
    pub use_fake_sdl: bool,

    /// Per-send retry budget while the bus reports a retryable condition.
    pub rmr_retry_times: u32,

    /// Base URL of the EI coordinator.
    pub ecs_service_host: String,

    /// Redis connection URL for the real store backend.
    pub sdl_url: String,

    /// Northbound HTTP listen port.
    pub http_port: u16,

    /// Bus listen port, handed to the transport.
    pub rmr_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_delete_no_resp_ttl: Duration::from_secs(DEFAULT_NO_RESP_TTL_SECONDS),
            instance_delete_resp_ttl: Duration::from_secs(DEFAULT_RESP_TTL_SECONDS),
            use_fake_sdl: false,
            rmr_retry_times: DEFAULT_RETRY_TIMES,
            ecs_service_host: DEFAULT_ECS_SERVICE_HOST.to_string(),
            sdl_url: DEFAULT_SDL_URL.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            rmr_port: DEFAULT_RMR_PORT,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            instance_delete_no_resp_ttl: Duration::from_secs(parse_var(
                "INSTANCE_DELETE_NO_RESP_TTL",
                env("INSTANCE_DELETE_NO_RESP_TTL"),
                DEFAULT_NO_RESP_TTL_SECONDS,
            )),
            instance_delete_resp_ttl: Duration::from_secs(parse_var(
                "INSTANCE_DELETE_RESP_TTL",
                env("INSTANCE_DELETE_RESP_TTL"),
                DEFAULT_RESP_TTL_SECONDS,
            )),
            use_fake_sdl: parse_flag(env("USE_FAKE_SDL")),
            rmr_retry_times: parse_var(
                "A1_RMR_RETRY_TIMES",
                env("A1_RMR_RETRY_TIMES"),
                DEFAULT_RETRY_TIMES,
            ),
            ecs_service_host: env("ECS_SERVICE_HOST")
                .unwrap_or_else(|| DEFAULT_ECS_SERVICE_HOST.to_string()),
            sdl_url: env("SDL_URL").unwrap_or_else(|| DEFAULT_SDL_URL.to_string()),
            http_port: parse_var("A1_HTTP_PORT", env("A1_HTTP_PORT"), DEFAULT_HTTP_PORT),
            rmr_port: parse_var("A1_RMR_PORT", env("A1_RMR_PORT"), DEFAULT_RMR_PORT),
        }
    }
}

/* ============================= PARSING ============================= */

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Parse a numeric variable, falling back to `default` on a malformed value.
fn parse_var<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match raw {
        None => default,
        Some(s) => match s.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %s, fallback = %default, "malformed_config_value");
                default
            }
        },
    }
}

/// Truthy values: "true", "1", "yes" (case-insensitive). Everything else is false.
fn parse_flag(raw: Option<String>) -> bool {
    match raw {
        None => false,
        Some(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
    }
}

/* ============================= TESTS ============================= */
