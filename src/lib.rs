//! # ArenaCache
//!
//! Memcached-compatible cache server whose values live in fixed-size,
//! block-allocated memory arenas.
//!
//! ## Features
//!
//! - Memcached ASCII protocol (get/gets, set/add/replace/append/prepend/cas,
//!   delete with hold time, incr/decr, flush_all with delay, stats)
//! - Partitioned index: one lock, one hash bucket array and one arena per
//!   partition
//! - First-fit block allocator with exact byte accounting
//! - FIFO or LRU eviction under item-count and free-space limits
//! - Prometheus metrics and health check endpoints
//!
//! ## Example
//!
//! ```ignore
//! use arenacache::cache::Cache;
//! use arenacache::config::Config;
//! use arenacache::storage::CacheElement;
//!
//! let config = Config::default();
//! let cache = Cache::open(&config.storage);
//! cache.set(CacheElement::new("greeting", 0, 0, b"hello".to_vec()))?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌───────────────────────────┐
//! │ memcache     │────▶│ server/protocol  │────▶│ Cache                     │
//! │ client       │     │  (tokio, ASCII)  │     │  ├─ verbs, stats          │
//! └──────────────┘     └──────────────────┘     │  └─ CacheStorage          │
//!                                               │      ├─ PartitionedIndex  │
//!                                               │      └─ MemoryStorage     │
//!                                               └───────────────────────────┘
//! ```

// Modules
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod prelude;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use error::{ArenaCacheError, ProtocolError, Result, StorageError};
