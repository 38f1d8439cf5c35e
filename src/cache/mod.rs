//! Generic caching layer for server entities.
//!
//! This module provides a domain-agnostic cache that:
//! - Fetches a list endpoint lazily and serves it until it goes stale
//! - Coalesces concurrent fetches into one request
//! - Upserts push payloads by identity key, without duplicates
//! - Mirrors every cache into durable key/value storage
//! - Broadcasts changes to any number of subscribers

pub mod bus;
mod layer;
pub mod payload;
pub mod storage;
mod traits;

pub use bus::{EventBus, Subscription};
pub use layer::{CacheConfig, CacheDeps, CacheEvent, CacheTopic, EntityCache, SortFn};
pub use storage::{KeyValueStore, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{normalize, shallow_merge, Entity, InsertOrder, MergeOutcome, RawRecord};
