//! Aggregator source: IsThereAnyDeal (ITAD).
//! Public API (base): https://api.isthereanydeal.com/
//!
//! Key endpoints:
//! - POST /lookup/id/shop/61/v1 - map Steam app ids to ITAD UUIDs (61 = Steam)
//! - POST /games/prices/v3      - current deals per shop + per-shop all-time lows
//! - POST /games/overview/v2    - bundle membership
//!
//! ITAD identifies games by internal UUIDs, not Steam app ids. The UUID
//! mapping is looked up once and cached in `games.itad_id`; a null mapping
//! means ITAD simply does not index that game.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::fetch::{classify_status, classify_transport, FetchError, ResilientFetcher, RetryPolicy};
use crate::sources::{SourceAdapter, SourceBatch};
use crate::store::db::Db;
use crate::store::models::{
    derive_discount, to_minor_units, Availability, BundleEntry, PriceQuote, ReportedLow, SourceKind,
    TrackedItem,
};

const STEAM_SHOP_ID: u32 = 61;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        s.truncate(max_len);
        s.push('…');
    }
    s
}

pub struct ItadAdapter {
    base_url: String,
    http: Client,
    fetcher: ResilientFetcher,
    api_key: String,
    country: String,
    currency: String,
    db: Db,
}

impl ItadAdapter {
    pub fn new(db: Db, api_key: String, country: String, currency: String) -> Result<Self> {
        Self::with_base_url(db, api_key, country, currency, None)
    }

    pub fn with_base_url(
        db: Db,
        api_key: String,
        country: String,
        currency: String,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://api.isthereanydeal.com")
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent("wishlist-watch/0.1")
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            base_url,
            http,
            fetcher: ResilientFetcher::new("itad", RetryPolicy::default()),
            api_key,
            country,
            currency,
            db,
        })
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, FetchError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .query(&[("key", self.api_key.as_str()), ("country", self.country.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
            debug!(%url, %status, body, "itad request failed");
            return Err(classify_status(status));
        }
        resp.json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Cacheable Steam-id to ITAD-UUID lookup. `Ok(None)` means the game is
    /// not in ITAD's index; lookup failures other than rate limiting also
    /// degrade to `None` so they never poison the rest of the fetch.
    async fn ensure_itad_id(&self, item: &TrackedItem) -> Result<Option<String>, FetchError> {
        if let Some(id) = &item.itad_id {
            return Ok(Some(id.clone()));
        }

        let app_id = item.app_id;
        let path = format!("/lookup/id/shop/{STEAM_SHOP_ID}/v1");
        let res = self
            .fetcher
            .call("id lookup", || {
                self.post_json(&path, json!([format!("app/{app_id}")]))
            })
            .await;

        match res {
            Ok(body) => {
                let uuid = body
                    .get(format!("app/{app_id}"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if let Some(uuid) = &uuid {
                    self.db
                        .set_itad_id(app_id, uuid)
                        .await
                        .map_err(|e| FetchError::Parse(format!("caching itad id: {e}")))?;
                    debug!(app_id, itad_id = %uuid, "cached aggregator id");
                }
                Ok(uuid)
            }
            Err(e @ FetchError::RateLimited { .. }) => Err(e),
            Err(e) => {
                warn!(app_id, error = %e, "itad id lookup failed; treating as unindexed");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ItadAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Aggregator
    }

    fn name(&self) -> &'static str {
        "itad"
    }

    async fn fetch_prices(&self, item: &TrackedItem) -> Result<SourceBatch, FetchError> {
        let Some(itad_id) = self.ensure_itad_id(item).await? else {
            return Ok(SourceBatch::default());
        };

        let prices = self
            .fetcher
            .call("prices/v3", || {
                self.post_json("/games/prices/v3", json!([itad_id.clone()]))
            })
            .await?;
        let observed_at = Utc::now();
        let (quotes, reported_lows) =
            parse_price_batch(item.app_id, &itad_id, &prices, &self.currency, observed_at);

        // Bundles ride along in a second call; its failure must not cost the
        // caller the prices already in hand, except for a rate-limit signal.
        let bundles = match self
            .fetcher
            .call("overview/v2", || {
                self.post_json("/games/overview/v2", json!([itad_id.clone()]))
            })
            .await
        {
            Ok(body) => parse_bundles(&body, &itad_id, &self.currency),
            Err(e @ FetchError::RateLimited { .. }) => return Err(e),
            Err(e) => {
                warn!(app_id = item.app_id, error = %e, "bundle overview fetch failed");
                Vec::new()
            }
        };

        Ok(SourceBatch {
            quotes,
            bundles,
            reported_lows,
        })
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    if let Some(n) = v.as_i64() {
        return Some(n as f64);
    }
    if let Some(s) = v.as_str() {
        return s.parse::<f64>().ok();
    }
    None
}

fn amount_minor(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key)
        .and_then(|p| p.get("amount"))
        .and_then(value_as_f64)
        .map(to_minor_units)
}

/// Normalize one game's `prices/v3` entry into quotes plus per-shop
/// reported all-time lows. The response is a list of game objects, each
/// with a `deals` array; every deal carries `shop`, `price`, `regular`,
/// `storeLow` and a store URL.
pub(crate) fn parse_price_batch(
    app_id: i64,
    itad_id: &str,
    body: &Value,
    currency: &str,
    observed_at: DateTime<Utc>,
) -> (Vec<PriceQuote>, Vec<ReportedLow>) {
    let mut quotes = Vec::new();
    let mut lows = Vec::new();

    let Some(games) = body.as_array() else {
        return (quotes, lows);
    };
    let Some(entry) = games
        .iter()
        .find(|g| g.get("id").and_then(|v| v.as_str()) == Some(itad_id))
    else {
        return (quotes, lows);
    };

    let Some(deals) = entry.get("deals").and_then(|v| v.as_array()) else {
        return (quotes, lows);
    };

    for deal in deals {
        let shop = deal
            .get("shop")
            .and_then(|s| s.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");

        let Some(price_minor) = amount_minor(deal, "price") else {
            continue;
        };
        let regular_minor = amount_minor(deal, "regular").unwrap_or(price_minor);
        let url = deal
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        quotes.push(PriceQuote {
            app_id,
            store: shop.to_string(),
            kind: SourceKind::Aggregator,
            price_minor,
            regular_minor,
            currency: currency.to_string(),
            discount_pct: derive_discount(price_minor, regular_minor),
            availability: Availability::InStock,
            url,
            observed_at,
        });

        if let Some(low_minor) = amount_minor(deal, "storeLow") {
            let recorded_at = deal
                .get("storeLow")
                .and_then(|l| l.get("timestamp"))
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            lows.push(ReportedLow {
                app_id,
                store: shop.to_string(),
                price_minor: low_minor,
                currency: currency.to_string(),
                recorded_at,
            });
        }
    }

    (quotes, lows)
}

/// Extract bundle membership from an `overview/v2` response. The bundle
/// price is the cheapest tier containing the game; `publish` (when present)
/// becomes the start date that keys idempotent re-observation.
pub(crate) fn parse_bundles(body: &Value, itad_id: &str, currency: &str) -> Vec<BundleEntry> {
    let mut out = Vec::new();

    let Some(bundles) = body.get("bundles").and_then(|v| v.as_array()) else {
        return out;
    };

    for bundle in bundles {
        // overview/v2 answers for every requested game; when the entry is
        // tagged with a game id, keep only ours.
        if let Some(id) = bundle.get("id").and_then(|v| v.as_str()) {
            if id != itad_id {
                continue;
            }
        }
        let Some(title) = bundle.get("title").and_then(|v| v.as_str()) else {
            continue;
        };
        let store = bundle
            .get("page")
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str())
            .or_else(|| bundle.get("type").and_then(|v| v.as_str()))
            .unwrap_or("Unknown");

        let tier_minor = bundle
            .get("tiers")
            .and_then(|v| v.as_array())
            .and_then(|tiers| {
                tiers
                    .iter()
                    .filter_map(|t| amount_minor(t, "price"))
                    .min()
            });

        let parse_date = |key: &str| {
            bundle
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        out.push(BundleEntry {
            title: title.to_string(),
            store: store.to_string(),
            price_minor: tier_minor,
            currency: currency.to_string(),
            url: bundle
                .get("url")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            starts_at: parse_date("publish"),
            expires_at: parse_date("expiry"),
        });
    }

    out
}
