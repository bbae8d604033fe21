use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use shared::domain::{Item, ItemId, NewItem, Snapshot};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Executor, Pool, Row, Sqlite,
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

mod cell;
mod error;
pub mod schema;

pub use cell::{shared_storage, StorageCell};
pub use error::StoreError;

/// Snapshots buffered per subscriber before it is considered lagging.
const SNAPSHOT_BUFFER: usize = 64;

pub type SnapshotStream = BoxStream<'static, Snapshot>;

/// Persisted item set with a push-based read channel.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Appends `item` and assigns it a fresh id. The caller validates the name.
    async fn insert(&self, item: NewItem) -> Result<ItemId, StoreError>;

    /// Removes the row with `item.id`. Deleting a missing id succeeds.
    async fn delete(&self, item: &Item) -> Result<(), StoreError>;

    /// Yields the current snapshot immediately, then a fresh snapshot after
    /// every committed mutation.
    async fn observe_all(&self) -> Result<SnapshotStream, StoreError>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    database_url: String,
    writer: Arc<Mutex<()>>,
    snapshots: broadcast::Sender<Snapshot>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database disappears with its last connection, so pin one.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        schema::apply(&pool).await?;

        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
            writer: Arc::new(Mutex::new(())),
            snapshots,
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        Ok(load_items(&self.pool).await?)
    }

    pub async fn insert_item(&self, item: &NewItem) -> Result<ItemId, StoreError> {
        let _writer = self.writer.lock().await;

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO shopping_items (name, quantity, unit, price) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&item.name)
        .bind(&item.quantity)
        .bind(&item.unit)
        .bind(&item.price)
        .fetch_one(&mut *tx)
        .await?;
        let item_id = ItemId(rec.get::<i64, _>(0));
        let items = load_items(&mut *tx).await?;
        tx.commit().await?;

        debug!(item_id = item_id.0, name = %item.name, "inserted item");
        self.publish(items);
        Ok(item_id)
    }

    /// Returns whether a row was removed. Nothing is published when the id
    /// was already gone.
    pub async fn delete_item(&self, item_id: ItemId) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM shopping_items WHERE id = ?")
            .bind(item_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            debug!(item_id = item_id.0, "delete skipped; item already gone");
            return Ok(false);
        }
        let items = load_items(&mut *tx).await?;
        tx.commit().await?;

        debug!(item_id = item_id.0, "deleted item");
        self.publish(items);
        Ok(true)
    }

    pub async fn subscribe(&self) -> Result<SnapshotStream, StoreError> {
        // Holding the writer lock keeps a mutation from landing between the
        // initial read and the receiver registration.
        let (current, receiver) = {
            let _writer = self.writer.lock().await;
            let current: Snapshot = Arc::new(load_items(&self.pool).await?);
            (current, self.snapshots.subscribe())
        };

        let updates = BroadcastStream::new(receiver).filter_map(|next| {
            future::ready(match next {
                Ok(snapshot) => Some(snapshot),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "snapshot subscriber lagged; resuming at newest");
                    None
                }
            })
        });

        Ok(stream::once(future::ready(current)).chain(updates).boxed())
    }

    fn publish(&self, items: Vec<Item>) {
        let count = items.len();
        let delivered = self.snapshots.send(Arc::new(items)).unwrap_or(0);
        debug!(items = count, subscribers = delivered, "published snapshot");
    }
}

#[async_trait]
impl ItemStore for Storage {
    async fn insert(&self, item: NewItem) -> Result<ItemId, StoreError> {
        self.insert_item(&item).await
    }

    async fn delete(&self, item: &Item) -> Result<(), StoreError> {
        self.delete_item(item.id).await.map(|_| ())
    }

    async fn observe_all(&self) -> Result<SnapshotStream, StoreError> {
        self.subscribe().await
    }
}

async fn load_items<'e, E>(executor: E) -> Result<Vec<Item>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT id, name, quantity, unit, price FROM shopping_items ORDER BY id DESC",
    )
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| Item {
            id: ItemId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            quantity: r.get::<String, _>(2),
            unit: r.get::<String, _>(3),
            price: r.get::<String, _>(4),
        })
        .collect())
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<(), StoreError> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|source| StoreError::Location {
        path: parent.to_path_buf(),
        database_url: database_url.to_string(),
        source,
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
