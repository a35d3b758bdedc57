//! Cooperative, poll-based cancellation scoped to a stage.

use super::JobStore;
use crate::models::Result;
use std::sync::Arc;
use tracing::info;

/// Durable stop flag for one stage.
///
/// Any process sharing the store can raise it; the running job polls it
/// between rows and winds down at the next boundary.
#[derive(Clone)]
pub struct CancellationChannel {
    store: Arc<dyn JobStore>,
    stage_id: String,
}

impl CancellationChannel {
    pub fn new(store: Arc<dyn JobStore>, stage_id: impl Into<String>) -> Self {
        Self {
            store,
            stage_id: stage_id.into(),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.store.stop_raised(&self.stage_id)
    }

    pub fn request_stop(&self) -> Result<()> {
        self.store.raise_stop(&self.stage_id)?;
        info!(stage = %self.stage_id, "Stop requested");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear_stop(&self.stage_id)
    }
}
