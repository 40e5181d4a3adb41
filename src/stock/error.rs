use crate::stock::store::{ProductId, StockLevel};
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a single stock job failed. The failure never affects other jobs.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("product {0} not found")]
    NotFound(ProductId),
    #[error("insufficient stock for product {product_id}: have {current}, change {delta}")]
    InsufficientStock {
        product_id: ProductId,
        current: i64,
        delta: i64,
    },
    #[error("stock overflow for product {product_id}")]
    Overflow { product_id: ProductId },
    #[error("stock update for product {product_id} timed out after {after:?}")]
    Timeout { product_id: ProductId, after: Duration },
    #[error("store error: {0}")]
    Store(#[source] BoxError),
}

/// One failed job within a batch.
#[derive(Debug)]
pub struct JobFailure {
    pub product_id: ProductId,
    pub delta: i64,
    pub error: StockError,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("stock batch is empty")]
    EmptyBatch,
    /// Some jobs failed. Jobs that succeeded stay committed.
    #[error("{} of {total} stock updates failed", .failures.len())]
    PartialFailure {
        total: usize,
        applied: Vec<StockLevel>,
        failures: Vec<JobFailure>,
    },
}
