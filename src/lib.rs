//! Client-side entity cache and real-time sync for a fish-farm management
//! backend.
//!
//! [`farm::FarmCache`] owns one cache per entity type. Lists are fetched over
//! REST ([`transport`]), mirrored to durable storage, and kept current by
//! pushes from the realtime channel ([`realtime::SyncBridge`]).

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod farm;
pub mod realtime;
pub mod sound;
pub mod transport;

#[cfg(test)]
mod testing;
