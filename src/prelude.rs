//! Prelude module for common imports.
//!
//! ```ignore
//! use arenacache::prelude::*;
//! ```

// Error types
pub use crate::error::{ArenaCacheError, ProtocolError, Result, StorageError};

// Configuration
pub use crate::config::{Config, MetricsConfig, ServerConfig, StorageBackend, StorageConfig};

// Cache engine
pub use crate::cache::{Cache, DeleteResponse, StoreResponse};

// Storage
pub use crate::storage::{
    CacheElement, CacheStorage, EvictionPolicy, Key, MemoryStorage, PartitionedIndex,
};

// Protocol
pub use crate::protocol::{Command, ParseResult, ResponseWriter};

// Metrics
pub use crate::metrics::Metrics;

// Server
pub use crate::server::Server;

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
