//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::api::error::{ApiError, ApiResult};
use crate::storage::{Storage, StorageResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage engine for reading/writing profiles
    pub storage: Arc<Storage>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, config: ApiConfig) -> Self {
        Self {
            storage,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Run a storage call on the blocking pool with the request deadline
    ///
    /// The engine does synchronous I/O on cache misses, so it must not run
    /// on the async workers.
    pub async fn run_blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Storage, Instant) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        let deadline = Instant::now() + Duration::from_millis(self.config.request_timeout_ms);

        tokio::task::spawn_blocking(move || f(&storage, deadline))
            .await
            .map_err(|e| ApiError::Internal(format!("Storage task failed: {}", e)))?
            .map_err(ApiError::from)
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4040,
            request_timeout_ms: 10_000,
            max_body_size: 10 * 1024 * 1024, // 10MB
            cors_origins: Vec::new(),
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&crate::config::ApiConfig> for ApiConfig {
    fn from(file: &crate::config::ApiConfig) -> Self {
        Self {
            host: file.host.clone(),
            port: file.port,
            request_timeout_ms: file.request_timeout_ms,
            max_body_size: file.max_body_size,
            cors_origins: file.cors_origins.clone(),
        }
    }
}
