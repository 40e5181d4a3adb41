//! Concurrent batch stock adjustment.
//!
//! A batch maps product ids to signed deltas. [`StockCoordinator`] spreads the
//! jobs over a bounded worker pool; each job is one locked unit of work in a
//! [`StockStore`].

pub mod coordinator;
pub mod error;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use coordinator::{BatchReport, LowStockAlerts, StockCoordinator};
pub use error::{BatchError, JobFailure, StockError};
#[cfg(feature = "postgres")]
pub use postgres::PgStockStore;
pub use store::{MemoryStockStore, ProductId, ProductStatus, StockLevel, StockStore};
