//! Catalog source: the user's Steam wishlist.
//!
//! Two endpoints: `IWishlistService/GetWishlist/v1` (api.steampowered.com,
//! keyed) pages out the raw app ids, then the store-front `appdetails`
//! endpoint (no key needed) supplies title/artwork/URL per app.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::fetch::{classify_status, classify_transport, FetchError, ResilientFetcher, RetryPolicy};
use crate::sources::{CatalogSource, SourceAdapter, SourceBatch};
use crate::store::db::Db;
use crate::store::models::{SourceKind, TrackedItem};

const WISHLIST_URL: &str = "https://api.steampowered.com/IWishlistService/GetWishlist/v1";
const APP_DETAILS_URL: &str = "https://store.steampowered.com/api/appdetails";
const PAGE_SIZE: usize = 500;
const DETAIL_CONCURRENCY: usize = 4;

pub struct SteamCatalog {
    http: Client,
    fetcher: ResilientFetcher,
    steam_id: String,
    api_key: String,
    country: String,
}

/// Metadata for one wishlist entry, as extracted from `appdetails`.
#[derive(Debug, Clone)]
struct AppDetails {
    title: String,
    steam_url: String,
    header_image: Option<String>,
}

impl SteamCatalog {
    pub fn new(steam_id: String, api_key: String, country: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("wishlist-watch/0.1")
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            fetcher: ResilientFetcher::new("steam", RetryPolicy::default()),
            steam_id,
            api_key,
            country,
        })
    }

    async fn wishlist_page(&self, start: usize) -> Result<Vec<i64>, FetchError> {
        let resp = self
            .http
            .get(WISHLIST_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("steamid", self.steam_id.as_str()),
            ])
            .query(&[("start", start), ("count", PAGE_SIZE)])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(parse_wishlist_ids(&body))
    }

    /// All wishlist app ids, paged until a short page.
    async fn fetch_wishlist_ids(&self) -> Result<Vec<i64>, FetchError> {
        let mut all = Vec::new();
        let mut start = 0usize;
        loop {
            let page = self
                .fetcher
                .call("wishlist page", || self.wishlist_page(start))
                .await?;
            let short = page.len() < PAGE_SIZE;
            all.extend(page);
            if short {
                break;
            }
            start += PAGE_SIZE;
        }
        Ok(all)
    }

    async fn app_details(&self, app_id: i64) -> Result<Option<AppDetails>, FetchError> {
        let resp = self
            .http
            .get(APP_DETAILS_URL)
            .query(&[("appids", app_id.to_string())])
            .query(&[("cc", self.country.as_str()), ("l", "en")])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(parse_app_details(app_id, &body))
    }

    /// Full catalog sync: page the wishlist, refresh details, upsert, and
    /// flag items no longer present remotely. Fatal if the wishlist itself
    /// is unreachable or the account is private; never mutates existing
    /// rows in that case.
    #[instrument(skip(self, db))]
    pub async fn sync(&self, db: &Db) -> Result<Vec<TrackedItem>> {
        let app_ids = self
            .fetch_wishlist_ids()
            .await
            .map_err(|e| anyhow!("catalog source unavailable: {e}"))?;

        if app_ids.is_empty() {
            // An empty result is indistinguishable from a private profile;
            // either way nothing downstream can run.
            return Err(anyhow!(
                "catalog source unavailable: wishlist empty or profile/game details not public"
            ));
        }
        info!(count = app_ids.len(), "fetched wishlist app ids");

        let details: Vec<(i64, Result<Option<AppDetails>, FetchError>)> =
            stream::iter(app_ids.iter().copied().map(|id| async move {
                let res = self
                    .fetcher
                    .call("app details", || self.app_details(id))
                    .await;
                (id, res)
            }))
            .buffer_unordered(DETAIL_CONCURRENCY)
            .collect()
            .await;

        let known: HashSet<i64> = db.get_items().await?.iter().map(|i| i.app_id).collect();
        let mut present: Vec<i64> = Vec::with_capacity(app_ids.len());
        let mut skipped = 0usize;
        for (app_id, res) in details {
            match res {
                Ok(Some(d)) => {
                    db.upsert_item(
                        app_id,
                        &d.title,
                        Some(d.steam_url.as_str()),
                        d.header_image.as_deref(),
                    )
                    .await
                    .context("upsert tracked item")?;
                    present.push(app_id);
                }
                Ok(None) => {
                    // Not a game (DLC, soundtrack, delisted app).
                    debug!(app_id, "skipping non-game wishlist entry");
                    skipped += 1;
                }
                Err(e) => {
                    // A single detail failure keeps any existing row intact.
                    warn!(app_id, error = %e, "app details fetch failed; keeping stored metadata");
                    if known.contains(&app_id) {
                        present.push(app_id);
                    }
                }
            }
        }

        let flagged = db.flag_unwishlisted(&present).await?;
        info!(
            upserted = present.len(),
            skipped, flagged, "catalog sync complete"
        );

        db.get_items().await
    }
}

fn parse_wishlist_ids(body: &Value) -> Vec<i64> {
    body.get("response")
        .and_then(|r| r.get("items"))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|it| it.get("appid").and_then(|v| v.as_i64()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_app_details(app_id: i64, body: &Value) -> Option<AppDetails> {
    let entry = body.get(app_id.to_string())?;
    if !entry.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let data = entry.get("data")?;
    // Games only; DLC and soundtracks clutter the tracker.
    if data.get("type").and_then(|v| v.as_str()) != Some("game") {
        return None;
    }
    Some(AppDetails {
        title: data
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("App {app_id}")),
        steam_url: format!("https://store.steampowered.com/app/{app_id}/"),
        header_image: data
            .get("header_image")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

#[async_trait]
impl CatalogSource for SteamCatalog {
    async fn sync(&self, db: &Db) -> Result<Vec<TrackedItem>> {
        SteamCatalog::sync(self, db).await
    }
}

/// Symmetry variant: the wishlist page reports no price of its own in this
/// architecture, so the catalog adapter always yields an empty batch. Steam's
/// own store price arrives through the aggregator like any other shop.
pub struct SteamStoreAdapter;

#[async_trait]
impl SourceAdapter for SteamStoreAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Catalog
    }

    fn name(&self) -> &'static str {
        "steam"
    }

    async fn fetch_prices(&self, _item: &TrackedItem) -> Result<SourceBatch, FetchError> {
        Ok(SourceBatch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wishlist_ids_from_response_shape() {
        let body = json!({
            "response": {
                "items": [
                    {"appid": 570, "priority": 1},
                    {"appid": 1091500, "priority": 2}
                ]
            }
        });
        assert_eq!(parse_wishlist_ids(&body), vec![570, 1091500]);
        assert!(parse_wishlist_ids(&json!({"response": {}})).is_empty());
    }

    #[test]
    fn app_details_filters_non_games() {
        let game = json!({
            "570": {"success": true, "data": {
                "type": "game", "name": "Dota 2", "header_image": "http://img"
            }}
        });
        let d = parse_app_details(570, &game).unwrap();
        assert_eq!(d.title, "Dota 2");
        assert_eq!(d.steam_url, "https://store.steampowered.com/app/570/");

        let dlc = json!({
            "99": {"success": true, "data": {"type": "dlc", "name": "OST"}}
        });
        assert!(parse_app_details(99, &dlc).is_none());

        let removed = json!({"99": {"success": false}});
        assert!(parse_app_details(99, &removed).is_none());
    }
}
