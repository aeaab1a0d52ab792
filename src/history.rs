//! Append-only price history and historic-low maintenance.
//!
//! The history append and the low update share one transaction: a crash
//! between the two must never leave the low ahead of the history it claims
//! to summarize.

use anyhow::Result;
use chrono::Utc;
use sqlx::Sqlite;
use tracing::debug;

use crate::store::db::Db;
use crate::store::models::{PriceQuote, ReconcileOutcome, ReportedLow};

/// Lower-or-insert the historic low for one (item, store) key. Monotonic:
/// once lowered it is never raised.
const LOWER_OR_INSERT: &str = r#"
INSERT INTO historic_lows (app_id, store, price_minor, currency, discount_pct, recorded_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(app_id, store) DO UPDATE SET
    price_minor  = excluded.price_minor,
    currency     = excluded.currency,
    discount_pct = excluded.discount_pct,
    recorded_at  = excluded.recorded_at
WHERE excluded.price_minor < historic_lows.price_minor
"#;

pub struct HistoryLedger {
    db: Db,
}

impl HistoryLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Record a reconciled quote. `Unchanged` outcomes write nothing; for
    /// `New`/`Updated` the history row and the low check commit atomically.
    pub async fn record(&self, quote: &PriceQuote, outcome: ReconcileOutcome) -> Result<()> {
        if outcome == ReconcileOutcome::Unchanged {
            return Ok(());
        }
        let mut tx = self.db.pool.begin().await?;
        self.record_in(&mut tx, quote, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transaction-scoped variant, run on the same connection as the
    /// reconcile that produced `outcome` so the canonical row and its
    /// history entry commit or roll back together.
    pub async fn record_in(
        &self,
        conn: &mut sqlx::SqliteConnection,
        quote: &PriceQuote,
        outcome: ReconcileOutcome,
    ) -> Result<()> {
        if outcome == ReconcileOutcome::Unchanged {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO price_history
                (app_id, store, price_minor, currency, discount_pct, availability, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(quote.app_id)
        .bind(&quote.store)
        .bind(quote.price_minor)
        .bind(&quote.currency)
        .bind(quote.discount_pct)
        .bind(quote.availability.as_str())
        .bind(quote.observed_at)
        .execute(&mut *conn)
        .await?;

        let lowered = sqlx::query(LOWER_OR_INSERT)
            .bind(quote.app_id)
            .bind(&quote.store)
            .bind(quote.price_minor)
            .bind(&quote.currency)
            .bind(quote.discount_pct)
            .bind(quote.observed_at)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        if lowered > 0 {
            debug!(
                app_id = quote.app_id,
                store = %quote.store,
                price_minor = quote.price_minor,
                "historic low lowered"
            );
        }
        Ok(())
    }

    /// Fold an aggregator-reported all-time low into the table through the
    /// same monotonic path. No history append: a reported low is a claim
    /// about the past, not an observation.
    pub async fn record_reported_low(&self, low: &ReportedLow) -> Result<()> {
        sqlx::query(LOWER_OR_INSERT)
            .bind(low.app_id)
            .bind(&low.store)
            .bind(low.price_minor)
            .bind(&low.currency)
            .bind(0i64)
            .bind(low.recorded_at.unwrap_or_else(Utc::now))
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Repair path: recompute a key's low from its full history. The stored
    /// low may legitimately be lower (aggregator-reported lows predate our
    /// observations), so this only ever lowers, like every other path.
    pub async fn repair_low(&self, app_id: i64, store: &str) -> Result<()> {
        // MIN over an empty set yields a single NULL row.
        let (min,): (Option<i64>,) = sqlx::query_as::<Sqlite, (Option<i64>,)>(
            "SELECT MIN(price_minor) FROM price_history WHERE app_id = ?1 AND store = ?2",
        )
        .bind(app_id)
        .bind(store)
        .fetch_one(&self.db.pool)
        .await?;

        if let Some(min_price) = min {
            sqlx::query(LOWER_OR_INSERT)
                .bind(app_id)
                .bind(store)
                .bind(min_price)
                .bind("GBP")
                .bind(0i64)
                .bind(Utc::now())
                .execute(&self.db.pool)
                .await?;
        }
        Ok(())
    }
}
