use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CaptureResult;

/// Environment prefix, e.g. `INSPECTOR_SERVER__PORT=9010`
const ENV_PREFIX: &str = "INSPECTOR";

/// Header lines the HTTP parser accepts per request; heads with more are
/// answered with 431 before a handler sees them
pub const PARSER_HEADER_LIMIT: usize = 96;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Number of consecutive ports probed, starting at `port`
    pub port_attempts: u16,
    pub workers: usize,
    pub client_request_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub max_capacity: usize,
    pub top_paths: usize,
    pub bucket_width_secs: i64,
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub max_body_size: usize,
    pub max_headers: usize,
    /// Header names whose values are masked before storage
    pub redact_headers: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9010,
            port_attempts: 10,
            workers: num_cpus::get(),
            client_request_timeout_ms: 5_000,
            shutdown_grace_secs: 2,
            stats_interval_secs: 60,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            top_paths: 10,
            bucket_width_secs: 3_600, // 1 hour
            event_buffer: 256,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_body_size: 1_048_576, // 1 MiB
            max_headers: 64,
            redact_headers: Vec::new(),
        }
    }
}

impl Settings {
    /// Load configuration from defaults overlaid with `INSPECTOR_*` environment variables
    pub fn load() -> CaptureResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("capture.redact_headers")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        Ok(settings.clamped())
    }

    /// Pull limits back inside what the HTTP layer can honour
    pub fn clamped(mut self) -> Self {
        if self.capture.max_headers > PARSER_HEADER_LIMIT {
            warn!(
                requested = self.capture.max_headers,
                limit = PARSER_HEADER_LIMIT,
                "max_headers exceeds the parser limit, clamping"
            );
            self.capture.max_headers = PARSER_HEADER_LIMIT;
        }
        self
    }
}
