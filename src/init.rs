use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::ndjson::NdjsonConfig;
use crate::provider::EchoProvider;
use crate::sse::SseConfig;
use crate::state::{AppState, StreamSettings};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub stream: StreamSettings,
    /// Pause between words of the demo echo provider.
    pub echo_delay: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let sse = SseConfig {
            heartbeat_interval: Duration::from_secs(var_or("SSE_HEARTBEAT_SECS", "15").parse()?),
            flush_after_write: var_or("SSE_FLUSH_AFTER_WRITE", "true").parse()?,
            max_retry_ms: match std::env::var("SSE_MAX_RETRY_MS") {
                Ok(value) => Some(value.parse()?),
                Err(_) => None,
            },
            write_buffer_size: var_or("SSE_WRITE_BUFFER", "8192").parse()?,
            replay_ids: var_or("SSE_REPLAY_IDS", "false").parse()?,
        };
        if sse.heartbeat_interval.is_zero() {
            return Err("SSE_HEARTBEAT_SECS must be greater than zero".into());
        }

        let ndjson = NdjsonConfig {
            write_buffer_size: var_or("NDJSON_WRITE_BUFFER", "8192").parse()?,
            flush_interval: Duration::from_millis(var_or("NDJSON_FLUSH_MS", "100").parse()?),
            pretty: var_or("NDJSON_PRETTY", "false").parse()?,
            include_timestamps: var_or("NDJSON_TIMESTAMPS", "true").parse()?,
        };
        if ndjson.flush_interval.is_zero() {
            return Err("NDJSON_FLUSH_MS must be greater than zero".into());
        }

        Ok(Self {
            host: var_or("HOST", "0.0.0.0"),
            port: var_or("PORT", "3000").parse()?,
            stream: StreamSettings {
                sse,
                ndjson,
                queue_capacity: var_or("STREAM_QUEUE_CAPACITY", "100").parse()?,
                compact: var_or("STREAM_COMPACT", "true").parse()?,
            },
            echo_delay: Duration::from_millis(var_or("ECHO_DELAY_MS", "50").parse()?),
        })
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    let provider = Arc::new(EchoProvider::new(config.echo_delay));
    log::info!("✅ Echo provider ready ({:?} between words)", config.echo_delay);

    let state = Arc::new(AppState::new(provider, config.stream.clone()));
    Ok((config, state))
}
