//! Farm entity stores built on the generic cache.

mod alerts;
pub mod api_types;
mod chat;
mod manager;
mod notifications;
mod records;
mod types;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::transport::{FetchOptions, Transport};

pub use alerts::AlertStore;
pub use chat::ChatStore;
pub use manager::{FarmCache, FarmSummary};
pub use notifications::NotificationStore;
pub use types::{
  Alert, AlertStatus, Conversation, Fish, Message, MessageStatus, Notification, Pond, Sampling,
  Severity, Task, TaskStatus, User,
};

/// Handle to a fire-and-forget remote mutation. Awaiting it is optional.
pub type RemoteCall = JoinHandle<Result<(), SyncError>>;

/// Spawn the remote half of an optimistic mutation.
///
/// Failures are logged and returned through the handle; local state is not
/// rolled back; the next forced fetch repairs any divergence.
pub(crate) fn spawn_remote(
  transport: Arc<dyn Transport>,
  action: &'static str,
  endpoint: String,
  options: FetchOptions,
) -> RemoteCall {
  tokio::spawn(async move {
    match transport.fetch_json(&endpoint, options).await {
      Ok(_) => {
        debug!(action, endpoint = %endpoint, "remote mutation applied");
        Ok(())
      }
      Err(e) => {
        let err = SyncError::mutation(action, &e);
        warn!(action, endpoint = %endpoint, error = %err, "remote mutation failed; next refresh will reconcile");
        Err(err)
      }
    }
  })
}
