use anyhow::Result;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Row, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::store::models::TrackedItem;

/// Idempotent schema, run on every startup (mirrors the legacy tracker's
/// `init_db`). `price_history` is append-only: nothing in this crate ever
/// updates or deletes its rows.
///
/// `bundles.starts_at` uses an empty string rather than NULL when the start
/// date is unknown, because SQLite treats NULLs as distinct in UNIQUE keys
/// and that would defeat the idempotent (app, title, store, start) upsert.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    app_id          INTEGER PRIMARY KEY,
    title           TEXT    NOT NULL,
    steam_url       TEXT,
    header_image    TEXT,
    itad_id         TEXT,
    loaded_url      TEXT,
    wishlisted      INTEGER NOT NULL DEFAULT 1,
    first_seen_at   TEXT    NOT NULL,
    last_checked_at TEXT
);

CREATE TABLE IF NOT EXISTS current_prices (
    app_id          INTEGER NOT NULL REFERENCES games(app_id),
    store           TEXT    NOT NULL,
    price_minor     INTEGER NOT NULL,
    regular_minor   INTEGER NOT NULL,
    currency        TEXT    NOT NULL DEFAULT 'GBP',
    discount_pct    INTEGER NOT NULL DEFAULT 0,
    availability    TEXT    NOT NULL DEFAULT 'unknown',
    url             TEXT,
    observed_at     TEXT    NOT NULL,
    UNIQUE(app_id, store)
);

CREATE TABLE IF NOT EXISTS price_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id          INTEGER NOT NULL REFERENCES games(app_id),
    store           TEXT    NOT NULL,
    price_minor     INTEGER NOT NULL,
    currency        TEXT    NOT NULL DEFAULT 'GBP',
    discount_pct    INTEGER NOT NULL DEFAULT 0,
    availability    TEXT    NOT NULL DEFAULT 'unknown',
    recorded_at     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS historic_lows (
    app_id          INTEGER NOT NULL REFERENCES games(app_id),
    store           TEXT    NOT NULL,
    price_minor     INTEGER NOT NULL,
    currency        TEXT    NOT NULL DEFAULT 'GBP',
    discount_pct    INTEGER NOT NULL DEFAULT 0,
    recorded_at     TEXT    NOT NULL,
    UNIQUE(app_id, store)
);

CREATE TABLE IF NOT EXISTS bundles (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    app_id          INTEGER NOT NULL REFERENCES games(app_id),
    bundle_title    TEXT    NOT NULL,
    store           TEXT    NOT NULL,
    price_minor     INTEGER,
    currency        TEXT    NOT NULL DEFAULT 'GBP',
    url             TEXT,
    starts_at       TEXT    NOT NULL DEFAULT '',
    expires_at      TEXT,
    discovered_at   TEXT    NOT NULL,
    UNIQUE(app_id, bundle_title, store, starts_at)
);

CREATE INDEX IF NOT EXISTS idx_current_app ON current_prices(app_id);
CREATE INDEX IF NOT EXISTS idx_history_key ON price_history(app_id, store, recorded_at);
CREATE INDEX IF NOT EXISTS idx_bundles_app ON bundles(app_id);
"#;

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database for tests (a pool of in-memory
    /// SQLite connections would each see a different database).
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Upsert a tracked item by catalog id. Title/image/URL are refreshed;
    /// `first_seen_at` is never overwritten; re-observing an item marks it
    /// wishlisted again.
    pub async fn upsert_item(
        &self,
        app_id: i64,
        title: &str,
        steam_url: Option<&str>,
        header_image: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO games (app_id, title, steam_url, header_image, wishlisted, first_seen_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT(app_id) DO UPDATE SET
                title        = excluded.title,
                steam_url    = excluded.steam_url,
                header_image = excluded.header_image,
                wishlisted   = 1
            "#,
        )
        .bind(app_id)
        .bind(title)
        .bind(steam_url)
        .bind(header_image)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag items absent from the remote wishlist. Nothing is deleted: the
    /// flag exists purely so the dashboard can dim removed games while their
    /// price history survives.
    pub async fn flag_unwishlisted(&self, present_ids: &[i64]) -> Result<u64> {
        if present_ids.is_empty() {
            let res = sqlx::query("UPDATE games SET wishlisted = 0 WHERE wishlisted = 1")
                .execute(&self.pool)
                .await?;
            return Ok(res.rows_affected());
        }

        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE games SET wishlisted = 0 WHERE wishlisted = 1 AND app_id NOT IN (");
        let mut sep = qb.separated(", ");
        for id in present_ids {
            sep.push_bind(id);
        }
        qb.push(")");
        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    pub async fn set_itad_id(&self, app_id: i64, itad_id: &str) -> Result<()> {
        sqlx::query("UPDATE games SET itad_id = ?1 WHERE app_id = ?2")
            .bind(itad_id)
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_loaded_url(&self, app_id: i64, url: &str) -> Result<()> {
        sqlx::query("UPDATE games SET loaded_url = ?1 WHERE app_id = ?2")
            .bind(url)
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_checked(&self, app_id: i64) -> Result<()> {
        sqlx::query("UPDATE games SET last_checked_at = ?1 WHERE app_id = ?2")
            .bind(Utc::now())
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_item(&self, app_id: i64) -> Result<Option<TrackedItem>> {
        let row = sqlx::query("SELECT * FROM games WHERE app_id = ?1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| item_from_row(&r)).transpose()
    }

    pub async fn get_items(&self) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query("SELECT * FROM games ORDER BY title")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }
}

fn item_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<TrackedItem> {
    Ok(TrackedItem {
        app_id: r.try_get("app_id")?,
        title: r.try_get("title")?,
        steam_url: r.try_get("steam_url")?,
        header_image: r.try_get("header_image")?,
        itad_id: r.try_get("itad_id")?,
        loaded_url: r.try_get("loaded_url")?,
        wishlisted: r.try_get::<i64, _>("wishlisted")? != 0,
        first_seen_at: r.try_get("first_seen_at")?,
        last_checked_at: r.try_get("last_checked_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_refreshes_metadata_but_keeps_first_seen() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(570, "Dota 2", Some("https://store/570"), None)
            .await
            .unwrap();
        let first = db.get_item(570).await.unwrap().unwrap();

        db.upsert_item(570, "Dota 2: Redux", Some("https://store/570"), Some("img"))
            .await
            .unwrap();
        let second = db.get_item(570).await.unwrap().unwrap();

        assert_eq!(second.title, "Dota 2: Redux");
        assert_eq!(second.header_image.as_deref(), Some("img"));
        assert_eq!(second.first_seen_at, first.first_seen_at);
    }

    #[tokio::test]
    async fn wishlist_removal_flags_without_deleting() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_item(570, "Dota 2", None, None).await.unwrap();
        db.upsert_item(620, "Portal 2", None, None).await.unwrap();

        // Next sync only reports 620.
        let flagged = db.flag_unwishlisted(&[620]).await.unwrap();
        assert_eq!(flagged, 1);

        let items = db.get_items().await.unwrap();
        assert_eq!(items.len(), 2);
        let dota = items.iter().find(|i| i.app_id == 570).unwrap();
        assert!(!dota.wishlisted);

        // Re-observing it restores the flag.
        db.upsert_item(570, "Dota 2", None, None).await.unwrap();
        assert!(db.get_item(570).await.unwrap().unwrap().wishlisted);
    }
}
