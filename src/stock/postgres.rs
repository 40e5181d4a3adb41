//! PostgreSQL-backed [`StockStore`].
//!
//! Each job runs in its own transaction and locks the product row with
//! `SELECT ... FOR UPDATE`, so concurrent batches stay correct across any
//! number of process instances sharing the database. A lock deadline is
//! enforced by the server through `SET LOCAL lock_timeout`, so the commit
//! itself is never cut short.

use crate::stock::error::StockError;
use crate::stock::store::{ProductId, ProductStatus, StockLevel, StockStore, plan_update};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const SELECT_FOR_UPDATE: &str = "SELECT name, stock::BIGINT, status FROM products \
     WHERE id = $1 AND deleted_at IS NULL FOR UPDATE";

const SELECT_LEVEL: &str = "SELECT name, stock::BIGINT, status FROM products \
     WHERE id = $1 AND deleted_at IS NULL";

const UPDATE_STOCK: &str = "UPDATE products SET stock = CAST($1 AS INTEGER), status = $2, \
     updated_at = NOW() WHERE id = $3";

impl From<sqlx::Error> for StockError {
    fn from(e: sqlx::Error) -> Self {
        StockError::Store(Box::new(e))
    }
}

#[derive(Debug, Clone)]
pub struct PgStockStore {
    pool: PgPool,
}

impl PgStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StockError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }
}

fn lock_timeout_statement(after: Duration) -> String {
    // Zero would disable the server-side timeout.
    format!("SET LOCAL lock_timeout = '{}ms'", after.as_millis().max(1))
}

fn lock_wait_error(e: sqlx::Error, product_id: ProductId, lock_wait: Option<Duration>) -> StockError {
    match (&e, lock_wait) {
        (sqlx::Error::Database(db), Some(after))
            if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) =>
        {
            StockError::Timeout { product_id, after }
        }
        _ => e.into(),
    }
}

fn parse_status(raw: &str) -> Result<ProductStatus, StockError> {
    raw.parse().map_err(|e: String| StockError::Store(e.into()))
}

#[async_trait]
impl StockStore for PgStockStore {
    async fn apply_delta_within(
        &self,
        product_id: ProductId,
        delta: i64,
        lock_wait: Option<Duration>,
    ) -> Result<StockLevel, StockError> {
        let id = i64::try_from(product_id).map_err(|_| StockError::NotFound(product_id))?;
        // Rolled back on drop unless committed.
        let mut tx = self.pool.begin().await?;
        if let Some(after) = lock_wait {
            sqlx::query(&lock_timeout_statement(after))
                .execute(&mut *tx)
                .await?;
        }

        let row: Option<(String, i64, String)> = sqlx::query_as(SELECT_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| lock_wait_error(e, product_id, lock_wait))?;
        let (name, current, status) = row.ok_or(StockError::NotFound(product_id))?;

        let (stock, status) = plan_update(product_id, current, parse_status(&status)?, delta)?;

        sqlx::query(UPDATE_STOCK)
            .bind(stock)
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(product_id, stock, status = %status, "Committed stock update.");
        Ok(StockLevel {
            product_id,
            name,
            stock,
            status,
        })
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<StockLevel, StockError> {
        let id = i64::try_from(product_id).map_err(|_| StockError::NotFound(product_id))?;
        let row: Option<(String, i64, String)> = sqlx::query_as(SELECT_LEVEL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let (name, stock, status) = row.ok_or(StockError::NotFound(product_id))?;
        Ok(StockLevel {
            product_id,
            name,
            stock,
            status: parse_status(&status)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_statement() {
        assert_eq!(
            lock_timeout_statement(Duration::from_secs(5)),
            "SET LOCAL lock_timeout = '5000ms'"
        );
        assert_eq!(
            lock_timeout_statement(Duration::from_micros(10)),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }

    #[test]
    fn test_other_errors_are_store_errors() {
        let err = lock_wait_error(sqlx::Error::RowNotFound, 3, Some(Duration::from_secs(1)));
        assert!(matches!(err, StockError::Store(_)));
    }
}
