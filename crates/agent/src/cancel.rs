//! Per-request cancellation handles.
//!
//! The executor registers a token under its request id before the
//! outbound call; a `CancelRequest` frame from the controller looks the
//! token up and trips it, which aborts the call and any body streaming.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a request id and return it.
    pub fn register(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(id.to_string(), token.clone());
        token
    }

    /// Drop the handle for a finished request.
    pub fn unregister(&self, id: &str) {
        self.tokens.lock().remove(id);
    }

    /// Trip the handle for a request, if it is still registered.
    pub fn cancel(&self, id: &str) {
        let token = self.tokens.lock().get(id).cloned();
        if let Some(token) = token {
            info!(request_id = %id, "Cancelling request");
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
