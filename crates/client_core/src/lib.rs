use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Item, ItemId, NewItem, Snapshot},
    error::{ErrorCode, ValidationError},
};
use storage::{ItemStore, StoreError};
use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error};

mod sharing;

pub use sharing::ListSubscription;
use sharing::SharedList;

/// How long the store subscription outlives its last consumer.
pub const DEFAULT_SHARE_GRACE: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub share_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            share_grace: DEFAULT_SHARE_GRACE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("mutation task did not complete: {0}")]
    Interrupted(String),
}

impl ControllerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ControllerError::Validation(err) => err.code(),
            ControllerError::Store(err) => err.code(),
            ControllerError::Interrupted(_) => ErrorCode::Internal,
        }
    }
}

/// A store mutation running in the background. Dropping the handle does not
/// cancel the mutation.
#[must_use = "dropping the handle discards the mutation result, not the mutation"]
pub struct PendingMutation<T> {
    handle: JoinHandle<Result<T, ControllerError>>,
}

impl<T> PendingMutation<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<T, ControllerError> {
        self.handle
            .await
            .unwrap_or_else(|join_err| Err(ControllerError::Interrupted(join_err.to_string())))
    }
}

/// Mediates between presentation and the item store: forwards add/delete and
/// keeps a shared, cached view of the item list.
pub struct ListController {
    store: Arc<dyn ItemStore>,
    runtime: Handle,
    list: SharedList,
}

impl ListController {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self::with_config(store, ControllerConfig::default())
    }

    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(store: Arc<dyn ItemStore>, config: ControllerConfig) -> Self {
        let runtime = Handle::current();
        let list = SharedList::new(Arc::clone(&store), runtime.clone(), config.share_grace);
        Self {
            store,
            runtime,
            list,
        }
    }

    /// Rejects a blank name synchronously; otherwise the insert runs in the
    /// background.
    pub fn add_item(
        &self,
        name: &str,
        quantity: &str,
        unit: &str,
        price: &str,
    ) -> Result<PendingMutation<ItemId>, ControllerError> {
        let item = NewItem::new(name, quantity, unit, price);
        item.validate()?;

        let store = Arc::clone(&self.store);
        let handle = self.runtime.spawn(async move {
            match store.insert(item).await {
                Ok(item_id) => {
                    debug!(item_id = item_id.0, "add_item committed");
                    Ok(item_id)
                }
                Err(err) => {
                    error!(error = %err, "add_item failed");
                    Err(ControllerError::from(err))
                }
            }
        });
        Ok(PendingMutation { handle })
    }

    pub fn delete_item(&self, item: Item) -> PendingMutation<()> {
        let store = Arc::clone(&self.store);
        let handle = self.runtime.spawn(async move {
            match store.delete(&item).await {
                Ok(()) => {
                    debug!(item_id = item.id.0, "delete_item committed");
                    Ok(())
                }
                Err(err) => {
                    error!(item_id = item.id.0, error = %err, "delete_item failed");
                    Err(ControllerError::from(err))
                }
            }
        });
        PendingMutation { handle }
    }

    /// Attaches a consumer to the live list. The subscription starts at the
    /// cached snapshot and follows the store while any consumer is attached.
    pub fn current_list(&self) -> ListSubscription {
        self.list.attach()
    }

    /// Last known list, without attaching. Empty until the first subscription
    /// has heard from the store.
    pub fn snapshot(&self) -> Snapshot {
        self.list.latest()
    }

    pub fn is_upstream_active(&self) -> bool {
        self.list.is_upstream_active()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
