//! Postgres-backed catalog, subscription, and delivery-ledger storage for Dealfeed.

use async_trait::async_trait;
use chrono::NaiveTime;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

use dealfeed_core::{CatalogEntry, OfferUpdate, Source, StoreStats, Subscription};

pub const CRATE_NAME: &str = "dealfeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("threshold {0} is outside 0..=100")]
    ThresholdOutOfRange(i32),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPool::connect(database_url).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn validate_threshold(threshold: i32) -> Result<(), StoreError> {
    if (0..=100).contains(&threshold) {
        Ok(())
    } else {
        Err(StoreError::ThresholdOutOfRange(threshold))
    }
}

/// Persistence seam for the ingestion and notification pipeline.
///
/// Jobs and the on-demand query layer are generic over this trait, which is
/// what lets the pipeline tests run against an in-memory store with the same
/// semantics as [`PgStore`].
#[async_trait]
pub trait DiscountStore: Send + Sync {
    /// Creates the user row if it does not exist; never fails on repeats.
    async fn ensure_user(&self, user_id: i64) -> Result<(), StoreError>;

    async fn source_by_name(&self, source_name: &str) -> Result<Option<Source>, StoreError>;

    /// Upserts one batch of normalized offers for a source, creating the
    /// source row on first reference. Re-running with identical input
    /// changes nothing observable. Returns the number of rows written.
    async fn upsert_entries(
        &self,
        source_name: &str,
        updates: &[OfferUpdate],
    ) -> Result<usize, StoreError>;

    /// Catalog entries of `source_id` with no delivery ledger row for
    /// `user_id`, newest first.
    async fn unseen_for(&self, user_id: i64, source_id: i64)
        -> Result<Vec<CatalogEntry>, StoreError>;

    /// Creates or replaces the (user, source) subscription. The threshold
    /// must be within 0..=100.
    async fn upsert_subscription(
        &self,
        user_id: i64,
        source_name: &str,
        threshold: i32,
        notify_time: NaiveTime,
    ) -> Result<(), StoreError>;

    /// Removes the subscription if present; returns whether a row was
    /// deleted. Removing a missing subscription is not an error.
    async fn remove_subscription(&self, user_id: i64, source_name: &str)
        -> Result<bool, StoreError>;

    async fn subscriptions_for(&self, user_id: i64) -> Result<Vec<Subscription>, StoreError>;

    /// All subscriptions whose notify time equals `notify_time` exactly
    /// (minute granularity).
    async fn due_at(&self, notify_time: NaiveTime) -> Result<Vec<Subscription>, StoreError>;

    /// Records that `entry_ids` were delivered to `user_id`, in one
    /// transaction. Entries already in the ledger are skipped silently.
    async fn mark_delivered(
        &self,
        user_id: i64,
        source_id: i64,
        entry_ids: &[i64],
    ) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_source(&self, source_name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (source_name)
            VALUES ($1)
            ON CONFLICT (source_name) DO UPDATE
               SET source_name = EXCLUDED.source_name
            RETURNING source_id
            "#,
        )
        .bind(source_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("source_id")?)
    }
}

fn entry_from_row(row: &PgRow) -> Result<CatalogEntry, sqlx::Error> {
    Ok(CatalogEntry {
        id: row.try_get("entry_id")?,
        source_id: row.try_get("source_id")?,
        product_name: row.try_get("product_name")?,
        price: row.try_get("price")?,
        old_price: row.try_get("old_price")?,
        discount_percent: row.try_get("discount_percent")?,
        observed_at: row.try_get("observed_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        user_id: row.try_get("user_id")?,
        source_id: row.try_get("source_id")?,
        source_name: row.try_get("source_name")?,
        threshold: row.try_get("threshold")?,
        notify_time: row.try_get("notify_time")?,
    })
}

#[async_trait]
impl DiscountStore for PgStore {
    async fn ensure_user(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn source_by_name(&self, source_name: &str) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query("SELECT source_id, source_name FROM sources WHERE source_name = $1")
            .bind(source_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Source {
                id: row.try_get("source_id")?,
                name: row.try_get("source_name")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_entries(
        &self,
        source_name: &str,
        updates: &[OfferUpdate],
    ) -> Result<usize, StoreError> {
        let source_id = self.ensure_source(source_name).await?;
        for update in updates {
            sqlx::query(
                r#"
                INSERT INTO catalog_entries
                    (source_id, product_name, price, old_price, discount_percent, observed_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (source_id, product_name) DO UPDATE
                   SET price = EXCLUDED.price,
                       old_price = EXCLUDED.old_price,
                       discount_percent = EXCLUDED.discount_percent,
                       observed_at = EXCLUDED.observed_at
                "#,
            )
            .bind(source_id)
            .bind(&update.product_name)
            .bind(&update.price)
            .bind(&update.old_price)
            .bind(update.discount_percent)
            .execute(&self.pool)
            .await?;
        }
        debug!(source_name, rows = updates.len(), "catalog upsert complete");
        Ok(updates.len())
    }

    async fn unseen_for(
        &self,
        user_id: i64,
        source_id: i64,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        // One statement, so catalog and ledger are read from a single
        // consistent snapshot.
        let rows = sqlx::query(
            r#"
            SELECT e.entry_id, e.source_id, e.product_name, e.price,
                   e.old_price, e.discount_percent, e.observed_at
              FROM catalog_entries e
              LEFT JOIN deliveries d
                ON d.entry_id = e.entry_id AND d.user_id = $1
             WHERE e.source_id = $2
               AND d.entry_id IS NULL
             ORDER BY e.observed_at DESC, e.entry_id DESC
            "#,
        )
        .bind(user_id)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    async fn upsert_subscription(
        &self,
        user_id: i64,
        source_name: &str,
        threshold: i32,
        notify_time: NaiveTime,
    ) -> Result<(), StoreError> {
        validate_threshold(threshold)?;
        self.ensure_user(user_id).await?;
        let source_id = self.ensure_source(source_name).await?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, source_id, threshold, notify_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, source_id) DO UPDATE
               SET threshold = EXCLUDED.threshold,
                   notify_time = EXCLUDED.notify_time
            "#,
        )
        .bind(user_id)
        .bind(source_id)
        .bind(threshold)
        .bind(notify_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_subscription(
        &self,
        user_id: i64,
        source_name: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM subscriptions s
             USING sources src
             WHERE s.source_id = src.source_id
               AND s.user_id = $1
               AND src.source_name = $2
            "#,
        )
        .bind(user_id)
        .bind(source_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn subscriptions_for(&self, user_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.user_id, s.source_id, src.source_name, s.threshold, s.notify_time
              FROM subscriptions s
              JOIN sources src ON src.source_id = s.source_id
             WHERE s.user_id = $1
             ORDER BY src.source_name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in &rows {
            subscriptions.push(subscription_from_row(row)?);
        }
        Ok(subscriptions)
    }

    async fn due_at(&self, notify_time: NaiveTime) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.user_id, s.source_id, src.source_name, s.threshold, s.notify_time
              FROM subscriptions s
              JOIN sources src ON src.source_id = s.source_id
             WHERE s.notify_time = $1
             ORDER BY s.user_id, src.source_name
            "#,
        )
        .bind(notify_time)
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in &rows {
            subscriptions.push(subscription_from_row(row)?);
        }
        Ok(subscriptions)
    }

    async fn mark_delivered(
        &self,
        user_id: i64,
        source_id: i64,
        entry_ids: &[i64],
    ) -> Result<(), StoreError> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry_id in entry_ids {
            sqlx::query(
                r#"
                INSERT INTO deliveries (user_id, source_id, entry_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, entry_id) DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(source_id)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM users) AS users,
                   (SELECT COUNT(*) FROM subscriptions) AS subscriptions,
                   (SELECT COUNT(*) FROM deliveries) AS deliveries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            users: row.try_get("users")?,
            subscriptions: row.try_get("subscriptions")?,
            deliveries: row.try_get("deliveries")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_validation_covers_both_bounds() {
        assert!(validate_threshold(0).is_ok());
        assert!(validate_threshold(100).is_ok());
        assert!(matches!(
            validate_threshold(-1),
            Err(StoreError::ThresholdOutOfRange(-1))
        ));
        assert!(matches!(
            validate_threshold(101),
            Err(StoreError::ThresholdOutOfRange(101))
        ));
    }
}
