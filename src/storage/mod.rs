//! Profilestore Storage Engine
//!
//! This module provides the core profile storage functionality:
//!
//! - **key**: Series keys (`app{label=value}`) and their canonical form
//! - **tree**: Profile trees, merge / split, collapsed text format
//! - **dict**: Per-series frame dictionary
//! - **segment**: Multi-resolution chunk index per series
//! - **cache**: Write-back LRU cache shared by all object kinds
//! - **kv**: SQLite-backed persistent key-value store
//! - **codec**: Framed, checksummed record encoding
//! - **engine**: Storage facade orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Put → Dictionary (intern) → Resolution (plan) → Tree chunks + Segment → Dimensions
//!
//! Read Path:
//!   Get → Segment (cover) → Tree chunks (load, merge) → Dictionary (resolve)
//!
//! Background:
//!   over budget: write back dirty → KvStore, then drop clean LRU entries
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use profilestore::storage::{GetInput, Key, PutInput, Storage, StorageConfig, Tree};
//! use chrono::{TimeZone, Utc};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new(StorageConfig::new("./data"))?;
//!
//!     let mut tree = Tree::new();
//!     tree.insert_stack("main;handle;parse", 12)?;
//!
//!     let key = Key::parse("api.cpu{env=prod}")?;
//!     let (from, until) = (Utc.timestamp_opt(10, 0).unwrap(), Utc.timestamp_opt(20, 0).unwrap());
//!     storage.put(PutInput::new(key.clone(), from, until, tree).metadata("rbspy", 100))?;
//!
//!     let out = storage.get(GetInput::new(key, from, until))?;
//!     print!("{}", out.tree);
//!
//!     storage.close()?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod dict;
pub mod engine;
pub mod error;
pub mod key;
pub mod kv;
pub mod segment;
pub mod tree;

// Re-export commonly used types
pub use cache::{Cache, Entry, Evict, Persist};
pub use codec::Kind;
pub use dict::Dictionary;
pub use engine::{GetInput, GetOutput, PutInput, Storage, StorageConfig, StorageStats};
pub use error::{StorageError, StorageResult};
pub use key::{parse_key, Key, NAME_LABEL};
pub use kv::KvStore;
pub use segment::{ChunkRef, Resolution, Segment};
pub use tree::{ChunkTree, StackTree, Tree, MAX_STACK_DEPTH};
