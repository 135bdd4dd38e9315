use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

// ============================================================================
// SESSION REGISTRY
// ============================================================================

/// Live stream sessions by request id, so a stream can be closed from
/// outside the connection that carries it.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active_sessions: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its cancellation token.
    ///
    /// Fails with a conflict when the request id is already streaming.
    pub async fn register(&self, request_id: &str) -> Result<CancellationToken> {
        let mut sessions = self.active_sessions.write().await;
        if sessions.contains_key(request_id) {
            return Err(AppError::conflict(format!(
                "request {} is already streaming",
                request_id
            )));
        }
        let token = CancellationToken::new();
        sessions.insert(request_id.to_string(), token.clone());
        Ok(token)
    }

    pub async fn cancel(&self, request_id: &str) -> bool {
        let sessions = self.active_sessions.read().await;
        match sessions.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn unregister(&self, request_id: &str) {
        let mut sessions = self.active_sessions.write().await;
        sessions.remove(request_id);
    }

    pub async fn active(&self) -> usize {
        self.active_sessions.read().await.len()
    }
}
