//! The unit-of-work seam between the coordinator and the product store.

use crate::stock::error::StockError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub type ProductId = u64;

/// Availability of a product, derived from its stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    OutOfStock,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Active => "active",
            ProductStatus::Inactive => "inactive",
            ProductStatus::OutOfStock => "out_of_stock",
        }
    }

    /// The status a product should have after its stock becomes `new_stock`.
    ///
    /// Reaching zero marks a product out of stock; restocking an out-of-stock
    /// product makes it active again. An inactive product stays inactive.
    pub fn after_stock_change(self, new_stock: i64) -> Self {
        if new_stock == 0 {
            ProductStatus::OutOfStock
        } else if self == ProductStatus::OutOfStock {
            ProductStatus::Active
        } else {
            self
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProductStatus::Active),
            "inactive" => Ok(ProductStatus::Inactive),
            "out_of_stock" => Ok(ProductStatus::OutOfStock),
            other => Err(format!("unknown product status {:?}", other)),
        }
    }
}

/// A product's stock as committed by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub name: String,
    pub stock: i64,
    pub status: ProductStatus,
}

/// Computes the new stock and status for one job, or why it must fail.
pub fn plan_update(
    product_id: ProductId,
    current: i64,
    status: ProductStatus,
    delta: i64,
) -> Result<(i64, ProductStatus), StockError> {
    let new_stock = current
        .checked_add(delta)
        .ok_or(StockError::Overflow { product_id })?;
    if new_stock < 0 {
        return Err(StockError::InsufficientStock {
            product_id,
            current,
            delta,
        });
    }
    Ok((new_stock, status.after_stock_change(new_stock)))
}

/// A product store offering locked, transactional read-modify-write on one
/// product row.
///
/// Implementations must hold an exclusive lock on the row for the whole of
/// [`apply_delta_within`](StockStore::apply_delta_within), so concurrent
/// updates to the same product are linearizable. Dropping the returned future
/// before it resolves must leave the row unchanged.
#[async_trait]
pub trait StockStore: Send + Sync + 'static {
    /// Adds `delta` to the product's stock in one unit of work and returns the
    /// committed level.
    ///
    /// `lock_wait` bounds only the wait for the row lock and fails the job with
    /// [`StockError::Timeout`]. Once the lock is held the unit of work runs to
    /// completion, so a reported timeout always means nothing was written.
    async fn apply_delta_within(
        &self,
        product_id: ProductId,
        delta: i64,
        lock_wait: Option<Duration>,
    ) -> Result<StockLevel, StockError>;

    /// [`apply_delta_within`](StockStore::apply_delta_within) without a lock deadline.
    async fn apply_delta(&self, product_id: ProductId, delta: i64) -> Result<StockLevel, StockError> {
        self.apply_delta_within(product_id, delta, None).await
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<StockLevel, StockError>;
}

#[derive(Debug)]
struct ProductRow {
    name: String,
    stock: i64,
    status: ProductStatus,
}

/// An in-process store where each product row carries its own lock.
///
/// Useful for tests and single-instance deployments. Updates to different
/// products never contend.
#[derive(Debug, Default)]
pub struct MemoryStockStore {
    rows: DashMap<ProductId, Arc<Mutex<ProductRow>>>,
}

impl MemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a product.
    pub fn insert(&self, product_id: ProductId, name: impl Into<String>, stock: i64, status: ProductStatus) {
        let row = ProductRow {
            name: name.into(),
            stock,
            status,
        };
        self.rows.insert(product_id, Arc::new(Mutex::new(row)));
    }

    fn row(&self, product_id: ProductId) -> Result<Arc<Mutex<ProductRow>>, StockError> {
        // Clone the row out so the map shard is not held across the row lock.
        self.rows
            .get(&product_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StockError::NotFound(product_id))
    }

    /// Holds a row's lock, as another transaction would.
    #[cfg(test)]
    pub(crate) async fn lock_row(&self, product_id: ProductId) -> tokio::sync::OwnedMutexGuard<impl Sized> {
        self.row(product_id)
            .expect("row exists")
            .lock_owned()
            .await
    }
}

#[async_trait]
impl StockStore for MemoryStockStore {
    async fn apply_delta_within(
        &self,
        product_id: ProductId,
        delta: i64,
        lock_wait: Option<Duration>,
    ) -> Result<StockLevel, StockError> {
        let row = self.row(product_id)?;
        let mut row = match lock_wait {
            Some(after) => timeout(after, row.lock())
                .await
                .map_err(|_| StockError::Timeout { product_id, after })?,
            None => row.lock().await,
        };

        let (stock, status) = plan_update(product_id, row.stock, row.status, delta)?;
        row.stock = stock;
        row.status = status;

        Ok(StockLevel {
            product_id,
            name: row.name.clone(),
            stock,
            status,
        })
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<StockLevel, StockError> {
        let row = self.row(product_id)?;
        let row = row.lock().await;
        Ok(StockLevel {
            product_id,
            name: row.name.clone(),
            stock: row.stock,
            status: row.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ProductStatus::*;
        assert_eq!(Active.after_stock_change(0), OutOfStock);
        assert_eq!(OutOfStock.after_stock_change(3), Active);
        assert_eq!(Active.after_stock_change(3), Active);
        assert_eq!(Inactive.after_stock_change(3), Inactive);
        assert_eq!(Inactive.after_stock_change(0), OutOfStock);
    }

    #[test]
    fn test_plan_update_rejects_negative_stock() {
        let err = plan_update(1, 10, ProductStatus::Active, -50).unwrap_err();
        assert!(matches!(
            err,
            StockError::InsufficientStock {
                product_id: 1,
                current: 10,
                delta: -50
            }
        ));
    }

    #[test]
    fn test_plan_update_rejects_overflow() {
        let err = plan_update(1, i64::MAX, ProductStatus::Active, 1).unwrap_err();
        assert!(matches!(err, StockError::Overflow { product_id: 1 }));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [ProductStatus::Active, ProductStatus::Inactive, ProductStatus::OutOfStock] {
            assert_eq!(status.as_str().parse::<ProductStatus>(), Ok(status));
        }
        assert!("deleted".parse::<ProductStatus>().is_err());
    }

    #[tokio::test]
    async fn test_memory_store_applies_and_rejects() {
        let store = MemoryStockStore::new();
        store.insert(1, "Teapot", 10, ProductStatus::Active);

        let level = store.apply_delta(1, -4).await.unwrap();
        assert_eq!(level.stock, 6);
        assert_eq!(level.name, "Teapot");

        assert!(matches!(
            store.apply_delta(1, -7).await,
            Err(StockError::InsufficientStock { .. })
        ));
        assert_eq!(store.stock_level(1).await.unwrap().stock, 6);

        assert!(matches!(
            store.apply_delta(2, 1).await,
            Err(StockError::NotFound(2))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_bounds_only_the_lock() {
        let store = MemoryStockStore::new();
        store.insert(1, "Teapot", 10, ProductStatus::Active);

        let guard = store.lock_row(1).await;
        let err = store
            .apply_delta_within(1, -1, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, StockError::Timeout { product_id: 1, .. }));
        drop(guard);

        let level = store
            .apply_delta_within(1, -1, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(level.stock, 9);
    }
}
