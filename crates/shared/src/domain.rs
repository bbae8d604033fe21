use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A persisted shopping-list row. Quantity and price are kept exactly as the
/// user typed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub quantity: String,
    pub unit: String,
    pub price: String,
}

impl Item {
    /// Quantity followed by unit, e.g. `"2 L"`, or just the quantity when no
    /// unit was given.
    pub fn quantity_label(&self) -> String {
        if self.unit.is_empty() {
            self.quantity.clone()
        } else {
            format!("{} {}", self.quantity, self.unit)
        }
    }
}

/// An item that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub quantity: String,
    pub unit: String,
    pub price: String,
}

impl NewItem {
    pub fn new(
        name: impl Into<String>,
        quantity: impl Into<String>,
        unit: impl Into<String>,
        price: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            quantity: quantity.into(),
            unit: unit.into(),
            price: price.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "item name must not be empty"));
        }
        Ok(())
    }
}

/// The full item list at one point in time, newest item first.
pub type Snapshot = Arc<Vec<Item>>;

pub fn empty_snapshot() -> Snapshot {
    Arc::new(Vec::new())
}
