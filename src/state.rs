use std::sync::Arc;

use crate::ndjson::NdjsonConfig;
use crate::pipeline::DEFAULT_QUEUE_CAPACITY;
use crate::provider::Provider;
use crate::registry::SessionRegistry;
use crate::sse::SseConfig;

/// Per-stream tuning shared by every session the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub sse: SseConfig,
    pub ndjson: NdjsonConfig,
    pub queue_capacity: usize,
    pub compact: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sse: SseConfig::default(),
            ndjson: NdjsonConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            compact: true,
        }
    }
}

pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub settings: StreamSettings,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(provider: Arc<dyn Provider>, settings: StreamSettings) -> Self {
        Self {
            provider,
            settings,
            sessions: SessionRegistry::new(),
        }
    }
}
