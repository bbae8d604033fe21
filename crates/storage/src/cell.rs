use tokio::sync::OnceCell;
use tracing::debug;

use crate::{Storage, StoreError};

static SHARED: StorageCell = StorageCell::new();

/// Opens a [`Storage`] at most once, no matter how many callers race on the
/// first access. A failed open leaves the cell empty so the next caller retries.
pub struct StorageCell {
    inner: OnceCell<Storage>,
}

impl StorageCell {
    pub const fn new() -> Self {
        Self {
            inner: OnceCell::const_new(),
        }
    }

    pub async fn get_or_open(&self, database_url: &str) -> Result<&Storage, StoreError> {
        let storage = self
            .inner
            .get_or_try_init(|| Storage::new(database_url))
            .await?;
        if storage.database_url() != database_url {
            debug!(
                requested = database_url,
                open = storage.database_url(),
                "storage already open; ignoring requested url"
            );
        }
        Ok(storage)
    }

    pub fn get(&self) -> Option<&Storage> {
        self.inner.get()
    }
}

impl Default for StorageCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide storage, opened on first use and kept for the process lifetime.
pub async fn shared_storage(database_url: &str) -> Result<&'static Storage, StoreError> {
    SHARED.get_or_open(database_url).await
}
