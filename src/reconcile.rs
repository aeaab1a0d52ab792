//! Merge incoming quotes into canonical current-price state.
//!
//! This is the dedup boundary: only `New`/`Updated` outcomes flow on to the
//! history ledger, so the append-only log records price *changes*, not
//! polling ticks.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

use crate::store::db::Db;
use crate::store::models::{Availability, PriceQuote, ReconcileOutcome};

/// An invariant violation during reconciliation. Should never occur under
/// correct keying; when it does, the offending write is rejected and logged
/// by the caller, never silently merged.
#[derive(Debug, Error)]
#[error(
    "conflicting write for app {app_id} @ {store}: observation at {incoming} predates stored {stored}"
)]
pub struct ConflictError {
    pub app_id: i64,
    pub store: String,
    pub incoming: DateTime<Utc>,
    pub stored: DateTime<Utc>,
}

pub struct Reconciler {
    db: Db,
}

impl Reconciler {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Compare a quote against the stored row for (item, store) and update
    /// canonical state in its own transaction. Per-key timestamps are
    /// monotonically non-decreasing; a stale observation is a conflict.
    pub async fn reconcile(&self, quote: &PriceQuote) -> Result<ReconcileOutcome> {
        let mut tx = self.db.pool.begin().await?;
        let outcome = self.reconcile_in(&mut tx, quote).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Transaction-scoped variant. The orchestrator runs this and the
    /// history append on one connection so a dropped or failed write rolls
    /// back the canonical row too; a change must never become invisible to
    /// the next run without its history entry committed alongside it.
    pub async fn reconcile_in(
        &self,
        conn: &mut sqlx::SqliteConnection,
        quote: &PriceQuote,
    ) -> Result<ReconcileOutcome> {
        let existing = sqlx::query(
            r#"
            SELECT price_minor, regular_minor, discount_pct, availability, observed_at
            FROM current_prices
            WHERE app_id = ?1 AND store = ?2
            "#,
        )
        .bind(quote.app_id)
        .bind(&quote.store)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = existing else {
            sqlx::query(
                r#"
                INSERT INTO current_prices
                    (app_id, store, price_minor, regular_minor, currency,
                     discount_pct, availability, url, observed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(quote.app_id)
            .bind(&quote.store)
            .bind(quote.price_minor)
            .bind(quote.regular_minor)
            .bind(&quote.currency)
            .bind(quote.discount_pct)
            .bind(quote.availability.as_str())
            .bind(&quote.url)
            .bind(quote.observed_at)
            .execute(&mut *conn)
            .await?;
            debug!(app_id = quote.app_id, store = %quote.store, "new price row");
            return Ok(ReconcileOutcome::New);
        };

        let stored_at: DateTime<Utc> = row.try_get("observed_at")?;
        if quote.observed_at < stored_at {
            return Err(ConflictError {
                app_id: quote.app_id,
                store: quote.store.clone(),
                incoming: quote.observed_at,
                stored: stored_at,
            }
            .into());
        }

        let same = row.try_get::<i64, _>("price_minor")? == quote.price_minor
            && row.try_get::<i64, _>("regular_minor")? == quote.regular_minor
            && row.try_get::<i64, _>("discount_pct")? == quote.discount_pct
            && Availability::parse(row.try_get::<&str, _>("availability")?) == quote.availability;

        if same {
            // Identical observation: discarded, the stored row stays as the
            // latest *accepted* quote.
            return Ok(ReconcileOutcome::Unchanged);
        }

        sqlx::query(
            r#"
            UPDATE current_prices SET
                price_minor   = ?3,
                regular_minor = ?4,
                currency      = ?5,
                discount_pct  = ?6,
                availability  = ?7,
                url           = ?8,
                observed_at   = ?9
            WHERE app_id = ?1 AND store = ?2
            "#,
        )
        .bind(quote.app_id)
        .bind(&quote.store)
        .bind(quote.price_minor)
        .bind(quote.regular_minor)
        .bind(&quote.currency)
        .bind(quote.discount_pct)
        .bind(quote.availability.as_str())
        .bind(&quote.url)
        .bind(quote.observed_at)
        .execute(&mut *conn)
        .await?;
        debug!(
            app_id = quote.app_id,
            store = %quote.store,
            price_minor = quote.price_minor,
            "price row updated"
        );
        Ok(ReconcileOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SourceKind;
    use chrono::Duration;

    async fn db_with_item() -> Db {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(570, "Dota 2", None, None).await.unwrap();
        db
    }

    fn quote(price_minor: i64, observed_at: DateTime<Utc>) -> PriceQuote {
        PriceQuote {
            app_id: 570,
            store: "Steam".into(),
            kind: SourceKind::Aggregator,
            price_minor,
            regular_minor: 1999,
            currency: "GBP".into(),
            discount_pct: crate::store::models::derive_discount(price_minor, 1999),
            availability: Availability::InStock,
            url: None,
            observed_at,
        }
    }

    #[tokio::test]
    async fn insert_update_unchanged() {
        let db = db_with_item().await;
        let r = Reconciler::new(db);
        let t0 = Utc::now();

        assert_eq!(r.reconcile(&quote(999, t0)).await.unwrap(), ReconcileOutcome::New);
        assert_eq!(
            r.reconcile(&quote(999, t0 + Duration::minutes(5))).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            r.reconcile(&quote(799, t0 + Duration::minutes(10))).await.unwrap(),
            ReconcileOutcome::Updated
        );
    }

    #[tokio::test]
    async fn availability_change_alone_is_an_update() {
        let db = db_with_item().await;
        let r = Reconciler::new(db);
        let t0 = Utc::now();

        r.reconcile(&quote(999, t0)).await.unwrap();
        let mut q = quote(999, t0 + Duration::minutes(1));
        q.availability = Availability::SoldOut;
        assert_eq!(r.reconcile(&q).await.unwrap(), ReconcileOutcome::Updated);
    }

    #[tokio::test]
    async fn stale_observation_is_a_conflict() {
        let db = db_with_item().await;
        let r = Reconciler::new(db.clone());
        let t0 = Utc::now();

        r.reconcile(&quote(999, t0)).await.unwrap();
        let err = r
            .reconcile(&quote(799, t0 - Duration::minutes(1)))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConflictError>().is_some());

        // The rejected write left the canonical row untouched.
        let row = sqlx::query("SELECT price_minor FROM current_prices WHERE app_id = 570")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.try_get::<i64, _>("price_minor").unwrap(), 999);
    }
}
