//! Error taxonomy for the cache and sync layer.

use thiserror::Error;

/// Errors produced by the cache layer.
///
/// `Clone` because a single in-flight fetch hands the same outcome to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// Network or HTTP failure during a fetch. The stale cache stays usable.
  #[error("failed to fetch {entity}: {message}")]
  TransientFetch {
    entity: &'static str,
    message: String,
  },

  /// A fire-and-forget remote mutation failed. Repaired by the next forced fetch.
  #[error("remote {action} failed: {message}")]
  OptimisticMutation { action: String, message: String },

  /// The push channel is down; reconnect and resync handle recovery.
  #[error("real-time connection lost: {0}")]
  ConnectionLost(String),
}

impl SyncError {
  pub fn fetch(entity: &'static str, err: &color_eyre::Report) -> Self {
    Self::TransientFetch {
      entity,
      message: format!("{:#}", err),
    }
  }

  pub fn mutation(action: impl Into<String>, err: &color_eyre::Report) -> Self {
    Self::OptimisticMutation {
      action: action.into(),
      message: format!("{:#}", err),
    }
  }
}
