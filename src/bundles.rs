//! Bundle membership persistence. Appearances are historical records: a
//! bundle ending (or the game leaving the wishlist) never removes rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::store::db::Db;
use crate::store::models::BundleEntry;

/// Start dates are stored as RFC 3339 text, with an empty string standing in
/// for "unknown" so the UNIQUE key still collapses repeat observations.
fn starts_at_key(starts_at: Option<DateTime<Utc>>) -> String {
    starts_at.map(|t| t.to_rfc3339()).unwrap_or_default()
}

pub struct BundleDetector {
    db: Db,
}

impl BundleDetector {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upsert reported bundle entries under the (item, title, store, start)
    /// key. Re-observing the same bundle across syncs is a no-op. Returns
    /// how many rows were actually new.
    pub async fn record_bundles(&self, app_id: i64, entries: &[BundleEntry]) -> Result<usize> {
        let mut inserted = 0usize;
        for entry in entries {
            let res = sqlx::query(
                r#"
                INSERT OR IGNORE INTO bundles
                    (app_id, bundle_title, store, price_minor, currency, url,
                     starts_at, expires_at, discovered_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(app_id)
            .bind(&entry.title)
            .bind(&entry.store)
            .bind(entry.price_minor)
            .bind(&entry.currency)
            .bind(&entry.url)
            .bind(starts_at_key(entry.starts_at))
            .bind(entry.expires_at)
            .bind(Utc::now())
            .execute(&self.db.pool)
            .await?;
            inserted += res.rows_affected() as usize;
        }
        if inserted > 0 {
            debug!(app_id, inserted, "recorded new bundle appearances");
        }
        Ok(inserted)
    }
}
