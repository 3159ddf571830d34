//! # Profilestore
//!
//! Continuous-profiling storage backend - ingests sampled call-stack trees
//! per labelled series and answers "merged profile over a time window"
//! queries at any zoom level, within a bounded memory budget.
//!
//! ## Features
//!
//! - **Multi-resolution**: every write lands at each level, so long windows
//!   are served from a handful of coarse chunks
//! - **Compact**: frames are interned per series; chunks are LZ4-compressed
//! - **Memory-bounded**: LRU write-back cache with background eviction
//! - **Durable**: SQLite in WAL mode, checksummed records
//!
//! ## Modules
//!
//! - [`storage`]: Core profile storage engine
//! - [`index`]: Label dimensions for series discovery
//! - [`api`]: REST API server with Axum
//! - [`config`]: TOML / environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use profilestore::storage::*;
//! use chrono::Utc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new(StorageConfig::default())?;
//!
//!     let tree = Tree::from_collapsed("main;work 3\nmain;idle 1\n")?;
//!     let until = Utc::now();
//!     let from = until - chrono::Duration::seconds(10);
//!     storage.put(PutInput::new(Key::parse("app.cpu")?, from, until, tree))?;
//!
//!     storage.get_values("__name__", |app| {
//!         println!("{}", app);
//!         true
//!     });
//!
//!     storage.close()?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    GetInput, GetOutput, Key, PutInput, Storage, StorageConfig, StorageError, StorageResult,
    StorageStats, Tree,
};

pub use index::{Dimension, LabelCatalog};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{
    ApiConfig as ConfigApiConfig, Config, ConfigError, LoggingConfig,
    StorageConfig as ConfigStorageConfig,
};
