//! Table layout and the schema-version policy.
//!
//! The version lives in SQLite's `user_version` header field. There is no
//! migration path: a database written by any other schema version is wiped
//! and recreated, discarding every stored item.

use sqlx::{Pool, Sqlite};
use tracing::{debug, warn};

pub const SCHEMA_VERSION: i64 = 1;
pub const ITEMS_TABLE: &str = "shopping_items";

const CREATE_ITEMS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS shopping_items (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        name     TEXT NOT NULL,
        quantity TEXT NOT NULL,
        unit     TEXT NOT NULL,
        price    TEXT NOT NULL
    )
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaAction {
    Create,
    Keep,
    DropAndRecreate,
}

/// Version 0 means nothing of ours was ever stamped on the file; a table
/// already sitting under our name has an unknown layout and is discarded.
pub fn plan(found_version: i64, table_exists: bool) -> SchemaAction {
    match found_version {
        0 if table_exists => on_version_mismatch(found_version),
        0 => SchemaAction::Create,
        SCHEMA_VERSION => SchemaAction::Keep,
        other => on_version_mismatch(other),
    }
}

/// Any version other than the current one is discarded wholesale.
pub fn on_version_mismatch(_found_version: i64) -> SchemaAction {
    SchemaAction::DropAndRecreate
}

pub async fn stored_version(pool: &Pool<Sqlite>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
}

pub async fn items_table_exists(pool: &Pool<Sqlite>) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(ITEMS_TABLE)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn apply(pool: &Pool<Sqlite>) -> Result<SchemaAction, sqlx::Error> {
    let found = stored_version(pool).await?;
    let action = plan(found, items_table_exists(pool).await?);
    match action {
        SchemaAction::Keep => {
            debug!(version = found, "schema up to date");
        }
        SchemaAction::Create => {
            debug!(version = SCHEMA_VERSION, "creating schema");
            create(pool).await?;
        }
        SchemaAction::DropAndRecreate => {
            warn!(
                found,
                expected = SCHEMA_VERSION,
                "schema version mismatch; discarding stored items"
            );
            drop_and_recreate(pool).await?;
        }
    }
    Ok(action)
}

async fn create(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(CREATE_ITEMS_TABLE).execute(&mut *tx).await?;
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

pub async fn drop_and_recreate(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {ITEMS_TABLE}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_ITEMS_TABLE).execute(&mut *tx).await?;
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}
