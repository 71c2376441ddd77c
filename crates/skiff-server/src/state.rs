use std::sync::Arc;

use crate::config::ServerConfig;
use crate::ratelimit::{RateLimiter, BLOCK_PERIOD};
use crate::storage::Storage;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: ServerConfig, storage: Arc<Storage>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                storage,
                rate_limiter: RateLimiter::new(BLOCK_PERIOD),
            }),
        }
    }

    pub fn storage(&self) -> Arc<Storage> {
        self.inner.storage.clone()
    }
}
