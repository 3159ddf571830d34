//! Profilestore index structures
//!
//! - **Dimension**: inverted index `label=value` → series keys, cached and
//!   persisted through the storage layer
//! - **LabelCatalog**: resident label → values view for discovery
//!
//! # Architecture
//!
//! ```text
//! Query: "series with env=prod and host=web-1"
//!        ↓
//! Dimension(env=prod) ∩ Dimension(host=web-1) → [app{env=prod,host=web-1}, ...]
//!        ↓
//! Segment / tree chunks of each series
//! ```

mod dimension;

pub use dimension::{
    dimension_id, intersect, parse_dimension_id, Dimension, LabelCatalog,
};
