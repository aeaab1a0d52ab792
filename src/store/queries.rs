//! Read-side queries: everything the CLI surfaces is assembled here from
//! canonical state, never recomputed from source responses.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row};

use crate::store::db::Db;
use crate::store::models::{Availability, BundleAppearance, CurrentPrice, HistoricLow, HistoryEntry};

/// Filters for the deals report. Both default to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DealsFilter {
    pub on_sale: bool,
    pub min_discount: Option<i64>,
}

/// One wishlisted game with its best current offer across stores.
#[derive(Debug, Clone)]
pub struct DealRow {
    pub app_id: i64,
    pub title: String,
    pub store: String,
    pub price_minor: i64,
    pub regular_minor: i64,
    pub currency: String,
    pub discount_pct: i64,
    pub availability: Availability,
    /// Lowest historic low over all stores, when any has been recorded.
    pub low_minor: Option<i64>,
    pub bundle_count: i64,
}

impl DealRow {
    pub fn at_historic_low(&self) -> bool {
        self.low_minor.is_some_and(|low| self.price_minor <= low)
    }
}

impl Db {
    pub async fn get_current_prices(&self, app_id: i64) -> Result<Vec<CurrentPrice>> {
        let rows = sqlx::query(
            "SELECT * FROM current_prices WHERE app_id = ?1 ORDER BY price_minor, store",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(CurrentPrice {
                    app_id: r.try_get("app_id")?,
                    store: r.try_get("store")?,
                    price_minor: r.try_get("price_minor")?,
                    regular_minor: r.try_get("regular_minor")?,
                    currency: r.try_get("currency")?,
                    discount_pct: r.try_get("discount_pct")?,
                    availability: Availability::parse(r.try_get::<String, _>("availability")?.as_str()),
                    url: r.try_get("url")?,
                    observed_at: r.try_get("observed_at")?,
                })
            })
            .collect()
    }

    /// Price-change log for one game, newest first, optionally narrowed to
    /// one store and/or a time floor.
    pub async fn get_history(
        &self,
        app_id: i64,
        store: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM price_history WHERE app_id = ");
        qb.push_bind(app_id);
        if let Some(store) = store {
            qb.push(" AND store = ").push_bind(store);
        }
        if let Some(since) = since {
            qb.push(" AND recorded_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY recorded_at DESC, id DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(HistoryEntry {
                    id: r.try_get("id")?,
                    app_id: r.try_get("app_id")?,
                    store: r.try_get("store")?,
                    price_minor: r.try_get("price_minor")?,
                    currency: r.try_get("currency")?,
                    discount_pct: r.try_get("discount_pct")?,
                    availability: Availability::parse(r.try_get::<String, _>("availability")?.as_str()),
                    recorded_at: r.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    pub async fn get_historic_lows(&self, app_id: i64) -> Result<Vec<HistoricLow>> {
        let rows =
            sqlx::query("SELECT * FROM historic_lows WHERE app_id = ?1 ORDER BY price_minor, store")
                .bind(app_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|r| {
                Ok(HistoricLow {
                    app_id: r.try_get("app_id")?,
                    store: r.try_get("store")?,
                    price_minor: r.try_get("price_minor")?,
                    currency: r.try_get("currency")?,
                    discount_pct: r.try_get("discount_pct")?,
                    recorded_at: r.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    pub async fn get_historic_low(&self, app_id: i64, store: &str) -> Result<Option<HistoricLow>> {
        let row = sqlx::query("SELECT * FROM historic_lows WHERE app_id = ?1 AND store = ?2")
            .bind(app_id)
            .bind(store)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(HistoricLow {
                app_id: r.try_get("app_id")?,
                store: r.try_get("store")?,
                price_minor: r.try_get("price_minor")?,
                currency: r.try_get("currency")?,
                discount_pct: r.try_get("discount_pct")?,
                recorded_at: r.try_get("recorded_at")?,
            })
        })
        .transpose()
    }

    pub async fn get_bundles(&self, app_id: i64) -> Result<Vec<BundleAppearance>> {
        let rows =
            sqlx::query("SELECT * FROM bundles WHERE app_id = ?1 ORDER BY discovered_at DESC, id DESC")
                .bind(app_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|r| {
                // starts_at uses '' as the unknown sentinel in the unique key.
                let starts_raw: String = r.try_get("starts_at")?;
                let starts_at = if starts_raw.is_empty() {
                    None
                } else {
                    Some(DateTime::parse_from_rfc3339(&starts_raw)?.with_timezone(&Utc))
                };
                Ok(BundleAppearance {
                    app_id: r.try_get("app_id")?,
                    bundle_title: r.try_get("bundle_title")?,
                    store: r.try_get("store")?,
                    price_minor: r.try_get("price_minor")?,
                    currency: r.try_get("currency")?,
                    url: r.try_get("url")?,
                    starts_at,
                    expires_at: r.try_get("expires_at")?,
                    discovered_at: r.try_get("discovered_at")?,
                })
            })
            .collect()
    }

    /// Best current offer per wishlisted game, cheapest store winning (store
    /// name breaking ties so the report is stable run to run).
    pub async fn get_deals_report(&self, filter: DealsFilter) -> Result<Vec<DealRow>> {
        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            r#"
            SELECT g.app_id, g.title,
                   cp.store, cp.price_minor, cp.regular_minor, cp.currency,
                   cp.discount_pct, cp.availability,
                   (SELECT MIN(hl.price_minor) FROM historic_lows hl
                     WHERE hl.app_id = g.app_id) AS low_minor,
                   (SELECT COUNT(*) FROM bundles b
                     WHERE b.app_id = g.app_id) AS bundle_count
            FROM games g
            JOIN (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY app_id ORDER BY price_minor, store
                ) AS rn
                FROM current_prices
            ) cp ON cp.app_id = g.app_id AND cp.rn = 1
            WHERE g.wishlisted = 1
            "#,
        );
        if filter.on_sale {
            qb.push(" AND cp.discount_pct > 0");
        }
        if let Some(min) = filter.min_discount {
            qb.push(" AND cp.discount_pct >= ").push_bind(min);
        }
        qb.push(" ORDER BY cp.discount_pct DESC, cp.price_minor, g.title");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(DealRow {
                    app_id: r.try_get("app_id")?,
                    title: r.try_get("title")?,
                    store: r.try_get("store")?,
                    price_minor: r.try_get("price_minor")?,
                    regular_minor: r.try_get("regular_minor")?,
                    currency: r.try_get("currency")?,
                    discount_pct: r.try_get("discount_pct")?,
                    availability: Availability::parse(r.try_get::<String, _>("availability")?.as_str()),
                    low_minor: r.try_get("low_minor")?,
                    bundle_count: r.try_get("bundle_count")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryLedger;
    use crate::reconcile::Reconciler;
    use crate::store::models::{derive_discount, PriceQuote, SourceKind};

    async fn seed_quote(db: &Db, app_id: i64, store: &str, price: i64, regular: i64) {
        let quote = PriceQuote {
            app_id,
            store: store.to_string(),
            kind: SourceKind::Aggregator,
            price_minor: price,
            regular_minor: regular,
            currency: "GBP".to_string(),
            discount_pct: derive_discount(price, regular),
            availability: Availability::InStock,
            url: None,
            observed_at: Utc::now(),
        };
        let outcome = Reconciler::new(db.clone()).reconcile(&quote).await.unwrap();
        HistoryLedger::new(db.clone())
            .record(&quote, outcome)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deals_report_picks_cheapest_store_per_game() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(10, "Alpha", None, None).await.unwrap();
        db.upsert_item(20, "Beta", None, None).await.unwrap();

        seed_quote(&db, 10, "steam", 1999, 3999).await; // 50%
        seed_quote(&db, 10, "loaded", 1499, 3999).await; // 63%, cheaper
        seed_quote(&db, 20, "steam", 2999, 2999).await; // full price

        let rows = db.get_deals_report(DealsFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "Alpha");
        assert_eq!(rows[0].store, "loaded");
        assert_eq!(rows[0].price_minor, 1499);
        assert!(rows[0].at_historic_low());

        let on_sale = db
            .get_deals_report(DealsFilter {
                on_sale: true,
                min_discount: None,
            })
            .await
            .unwrap();
        assert_eq!(on_sale.len(), 1);
        assert_eq!(on_sale[0].app_id, 10);
    }

    #[tokio::test]
    async fn min_discount_filter_applies_to_best_offer() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(10, "Alpha", None, None).await.unwrap();
        db.upsert_item(20, "Beta", None, None).await.unwrap();
        seed_quote(&db, 10, "steam", 2000, 4000).await; // 50%
        seed_quote(&db, 20, "steam", 3600, 4000).await; // 10%

        let rows = db
            .get_deals_report(DealsFilter {
                on_sale: false,
                min_discount: Some(40),
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Alpha");
    }

    #[tokio::test]
    async fn unwishlisted_games_drop_out_of_the_report() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(10, "Alpha", None, None).await.unwrap();
        seed_quote(&db, 10, "steam", 1000, 1000).await;

        db.flag_unwishlisted(&[]).await.unwrap();
        let rows = db.get_deals_report(DealsFilter::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn history_filters_by_store_and_since() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(10, "Alpha", None, None).await.unwrap();
        seed_quote(&db, 10, "steam", 2000, 4000).await;
        seed_quote(&db, 10, "loaded", 1800, 4000).await;
        seed_quote(&db, 10, "steam", 1500, 4000).await;

        let all = db.get_history(10, None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let steam_only = db.get_history(10, Some("steam"), None).await.unwrap();
        assert_eq!(steam_only.len(), 2);
        assert_eq!(steam_only[0].price_minor, 1500);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = db.get_history(10, None, Some(future)).await.unwrap();
        assert!(none.is_empty());
    }
}
