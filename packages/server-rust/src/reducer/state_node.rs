//! Process-wide state-node singleton.
//!
//! [`init_state_node`] connects and starts exactly one [`Reducer`] per
//! process. Once it has succeeded, later calls return the running reducer and
//! ignore their options. A failed attempt leaves nothing behind, so the
//! caller may retry.

use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;
use tracing::info;

use super::Reducer;
use crate::config::StateNodeOptions;
use crate::error::CacheError;

fn cell() -> &'static OnceCell<Arc<Reducer>> {
    static STATE_NODE: OnceLock<OnceCell<Arc<Reducer>>> = OnceLock::new();
    STATE_NODE.get_or_init(OnceCell::new)
}

/// Connects and starts the process-wide reducer. Idempotent.
///
/// # Errors
///
/// The first error from the remote-store check or bus client construction.
pub async fn init_state_node(options: StateNodeOptions) -> Result<Arc<Reducer>, CacheError> {
    cell()
        .get_or_try_init(|| async move {
            let reducer = Arc::new(Reducer::connect(options).await?);
            reducer.start();
            info!(group = reducer.group(), "state node initialised");
            Ok::<_, CacheError>(reducer)
        })
        .await
        .map(Arc::clone)
}

/// The running reducer, if [`init_state_node`] has succeeded.
#[must_use]
pub fn state_node() -> Option<Arc<Reducer>> {
    cell().get().cloned()
}

/// Stops the process-wide reducer. The singleton stays initialised, so a
/// later [`init_state_node`] does not start a new one.
pub async fn shutdown_state_node() {
    if let Some(reducer) = cell().get() {
        reducer.shutdown().await;
    }
}
