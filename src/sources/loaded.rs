//! Scraped-store source: loaded.com (UK key reseller, no API).
//!
//! Product URLs follow `https://www.loaded.com/{slug}-pc-steam`. When the
//! slug guess 404s, we fall back to site search and fuzzy-match the result
//! titles. All page-structure assumptions live in the parse helpers at the
//! bottom of this file so markup drift stays contained.
//!
//! The site blocks aggressive clients with 403s, so every request goes
//! through the shared fetcher with 403 mapped to a rate-limit signal, and
//! the orchestrator holds this source to one in-flight request.

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::fetch::{classify_status, classify_transport, FetchError, ResilientFetcher, RetryPolicy};
use crate::sources::{SourceAdapter, SourceBatch};
use crate::store::db::Db;
use crate::store::models::{
    derive_discount, to_minor_units, Availability, PriceQuote, SourceKind, TrackedItem,
};

const STORE_LABEL: &str = "Loaded";
/// Below this similarity a search hit is "not found", never a guess.
const MATCH_THRESHOLD: f64 = 0.7;

pub struct LoadedAdapter {
    base_url: String,
    http: Client,
    fetcher: ResilientFetcher,
    currency: String,
    db: Db,
}

impl LoadedAdapter {
    pub fn new(db: Db, currency: String) -> Result<Self> {
        Self::with_base_url(db, currency, None)
    }

    pub fn with_base_url(db: Db, currency: String, base_url: Option<&str>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://www.loaded.com")
            .trim_end_matches('/')
            .to_string();
        // A browser-like user agent; the site serves bot UAs a 403 wall.
        let http = Client::builder()
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            base_url,
            http,
            fetcher: ResilientFetcher::new("loaded", RetryPolicy::default()),
            currency,
            db,
        })
    }

    fn classify(status: reqwest::StatusCode) -> FetchError {
        // 403 here is the site's anti-bot wall, not a permanent block:
        // treated as a rate limit so the whole source cools down.
        if status == reqwest::StatusCode::FORBIDDEN {
            FetchError::RateLimited { cooldown: None }
        } else {
            classify_status(status)
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.fetcher
            .call("page", || async {
                let resp = self
                    .http
                    .get(url)
                    .header("Accept", "text/html,application/xhtml+xml")
                    .header("Accept-Language", "en-GB,en;q=0.9")
                    .send()
                    .await
                    .map_err(classify_transport)?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(Self::classify(status));
                }
                resp.text()
                    .await
                    .map_err(|e| FetchError::Transient(e.to_string()))
            })
            .await
    }

    /// Locate the product page. A previously resolved URL is cached on the
    /// item; otherwise the slug guess is tried first, then site search.
    /// Returns the page HTML together with the URL it came from.
    async fn find_product_page(
        &self,
        item: &TrackedItem,
    ) -> Result<Option<(String, String)>, FetchError> {
        if let Some(cached) = &item.loaded_url {
            match self.fetch_page(cached).await {
                Ok(html) => return Ok(Some((html, cached.clone()))),
                Err(FetchError::ItemNotFound) => {
                    // Product pages get re-slugged; fall through and re-resolve.
                    debug!(url = %cached, "cached product url gone; re-resolving");
                }
                Err(e) => return Err(e),
            }
        }

        let direct = format!("{}/{}-pc-steam", self.base_url, slugify_title(&item.title));
        match self.fetch_page(&direct).await {
            Ok(html) => return Ok(Some((html, direct))),
            Err(FetchError::ItemNotFound) => {
                debug!(url = %direct, "no product at slug url; falling back to search");
            }
            Err(e) => return Err(e),
        }

        let search_url = format!(
            "{}/catalogsearch/result/?q={}",
            self.base_url,
            urlencoding::encode(&item.title)
        );
        let html = match self.fetch_page(&search_url).await {
            Ok(html) => html,
            Err(FetchError::ItemNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let hits = parse_search_results(&html);
        let Some(hit) = pick_best_match(&item.title, &hits) else {
            debug!(
                title = %item.title,
                candidates = hits.len(),
                "no search hit above similarity threshold"
            );
            return Ok(None);
        };
        debug!(title = %item.title, matched = %hit.title, url = %hit.url, "search hit selected");

        match self.fetch_page(&hit.url).await {
            Ok(html) => Ok(Some((html, hit.url.clone()))),
            Err(FetchError::ItemNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for LoadedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::ScrapedStore
    }

    fn name(&self) -> &'static str {
        "loaded"
    }

    async fn fetch_prices(&self, item: &TrackedItem) -> Result<SourceBatch, FetchError> {
        let Some((html, url)) = self.find_product_page(item).await? else {
            return Ok(SourceBatch::default());
        };

        if item.loaded_url.as_deref() != Some(url.as_str()) {
            if let Err(e) = self.db.set_loaded_url(item.app_id, &url).await {
                warn!(app_id = item.app_id, error = %e, "failed to cache product url");
            }
        }

        let availability = parse_availability(&html);
        let Some((price_minor, regular_minor)) = parse_prices(&html) else {
            if availability == Availability::SoldOut {
                // Sold-out pages often drop the price block entirely.
                return Ok(SourceBatch::default());
            }
            warn!(app_id = item.app_id, title = %item.title, "product page had no parseable price");
            return Err(FetchError::Parse("price not found on product page".into()));
        };

        let quote = PriceQuote {
            app_id: item.app_id,
            store: STORE_LABEL.to_string(),
            kind: SourceKind::ScrapedStore,
            price_minor,
            regular_minor,
            currency: self.currency.clone(),
            discount_pct: derive_discount(price_minor, regular_minor),
            availability,
            url: Some(url),
            observed_at: Utc::now(),
        };

        Ok(SourceBatch {
            quotes: vec![quote],
            ..SourceBatch::default()
        })
    }
}

/// Convert a title to the site's URL slug.
/// "Warhammer 40,000: Space Marine 2" -> "warhammer-40-000-space-marine-2"
/// "Baldur's Gate 3" -> "baldur-s-gate-3"
pub(crate) fn slugify_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = false;
    for ch in title.chars() {
        let c = ch.to_ascii_lowercase();
        match c {
            ':' => {} // colons vanish rather than hyphenate
            'a'..='z' | '0'..='9' => {
                out.push(c);
                last_dash = false;
            }
            _ if c.is_alphanumeric() => {} // non-ASCII letters are dropped
            _ => {
                if !last_dash && !out.is_empty() {
                    out.push('-');
                    last_dash = true;
                }
            }
        }
    }
    out.trim_end_matches('-').to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SearchHit {
    pub title: String,
    pub url: String,
}

/// Design policy for the fragile search path: an exact case-insensitive
/// title match always wins regardless of the store's own ranking; otherwise
/// the most similar candidate above the threshold; below it, not found.
pub(crate) fn pick_best_match<'a>(target: &str, hits: &'a [SearchHit]) -> Option<&'a SearchHit> {
    if let Some(exact) = hits
        .iter()
        .find(|h| h.title.trim().eq_ignore_ascii_case(target.trim()))
    {
        return Some(exact);
    }

    hits.iter()
        .map(|h| {
            (
                h,
                strsim::normalized_levenshtein(
                    &h.title.trim().to_lowercase(),
                    &target.trim().to_lowercase(),
                ),
            )
        })
        .filter(|(_, score)| *score >= MATCH_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(h, _)| h)
}

fn product_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<a[^>]*class="[^"]*product-item-link[^"]*"[^>]*href="([^"]+)"[^>]*>\s*(.*?)\s*</a>"#,
        )
        .expect("static regex")
    })
}

fn strip_tags(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"));
    re.replace_all(s, "").trim().to_string()
}

pub(crate) fn parse_search_results(html: &str) -> Vec<SearchHit> {
    product_link_re()
        .captures_iter(html)
        .filter_map(|cap| {
            let url = cap.get(1)?.as_str().trim().to_string();
            let title = strip_tags(cap.get(2)?.as_str());
            if title.is_empty() {
                None
            } else {
                Some(SearchHit { title, url })
            }
        })
        .collect()
}

/// Pull (current, regular) prices in minor units out of a product page. The
/// first sterling amount on the page is the sale price, the second (when
/// present) the struck-through regular price; a schema.org meta tag is the
/// fallback.
pub(crate) fn parse_prices(html: &str) -> Option<(i64, i64)> {
    static POUND_RE: OnceLock<Regex> = OnceLock::new();
    static META_RE: OnceLock<Regex> = OnceLock::new();
    let pound = POUND_RE.get_or_init(|| Regex::new(r"£\s*([0-9]+(?:\.[0-9]{1,2})?)").expect("static regex"));
    let meta = META_RE.get_or_init(|| {
        Regex::new(r#"<meta\s+itemprop="price"\s+content="([0-9.]+)""#).expect("static regex")
    });

    let amounts: Vec<f64> = pound
        .captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .collect();

    if let Some(&current) = amounts.first() {
        let regular = amounts.get(1).copied().unwrap_or(current);
        // A "regular" below the sale price is a related-product artifact,
        // not a discount baseline.
        let regular = if regular >= current { regular } else { current };
        return Some((to_minor_units(current), to_minor_units(regular)));
    }

    let current = meta
        .captures(html)
        .and_then(|c| c.get(1)?.as_str().parse::<f64>().ok())?;
    Some((to_minor_units(current), to_minor_units(current)))
}

pub(crate) fn parse_availability(html: &str) -> Availability {
    let lower = html.to_lowercase();
    if lower.contains("out of stock") || lower.contains("sold out") {
        Availability::SoldOut
    } else if lower.contains("coming soon") || lower.contains("pre-order") {
        Availability::ComingSoon
    } else {
        Availability::InStock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_match_site_conventions() {
        assert_eq!(
            slugify_title("Warhammer 40,000: Space Marine 2"),
            "warhammer-40-000-space-marine-2"
        );
        assert_eq!(slugify_title("Baldur's Gate 3"), "baldur-s-gate-3");
        assert_eq!(slugify_title("L.A. Noire"), "l-a-noire");
        assert_eq!(slugify_title("Stardew Valley"), "stardew-valley");
    }

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: format!("https://example.com/{}", slugify_title(title)),
        }
    }

    #[test]
    fn exact_case_insensitive_match_beats_store_ranking() {
        // The store ranks a deluxe edition first; the exact title still wins.
        let hits = vec![
            hit("ELDEN RING Deluxe Edition"),
            hit("elden ring"),
            hit("ELDEN RING Shadow of the Erdtree"),
        ];
        let best = pick_best_match("Elden Ring", &hits).unwrap();
        assert_eq!(best.title, "elden ring");
    }

    #[test]
    fn below_threshold_is_not_found_rather_than_a_guess() {
        let hits = vec![hit("Farming Simulator 25"), hit("Cities Skylines II")];
        assert!(pick_best_match("Hollow Knight: Silksong", &hits).is_none());
    }

    #[test]
    fn best_similar_candidate_wins_above_threshold() {
        let hits = vec![hit("Cyberpunk 2077 Phantom Liberty"), hit("Cyberpunk 2077 GOTY")];
        let best = pick_best_match("Cyberpunk 2077", &hits).unwrap();
        assert_eq!(best.title, "Cyberpunk 2077 GOTY");
    }

    #[test]
    fn prices_prefer_first_two_sterling_amounts() {
        let html = r#"<div class="price">£14.99</div><div class="old-price">£29.99</div>
                      <div class="related">£4.99</div>"#;
        assert_eq!(parse_prices(html), Some((1499, 2999)));
    }

    #[test]
    fn single_price_means_no_discount() {
        assert_eq!(parse_prices("<span>£9.99</span>"), Some((999, 999)));
    }

    #[test]
    fn meta_tag_fallback_and_absent_price() {
        let html = r#"<meta itemprop="price" content="19.99">"#;
        assert_eq!(parse_prices(html), Some((1999, 1999)));
        assert_eq!(parse_prices("<html>no prices here</html>"), None);
    }

    #[test]
    fn related_item_cheaper_than_sale_price_is_not_a_baseline() {
        let html = "<div>£14.99</div><div>£4.99</div>";
        assert_eq!(parse_prices(html), Some((1499, 1499)));
    }

    #[test]
    fn availability_states() {
        assert_eq!(parse_availability("<b>Out of Stock</b>"), Availability::SoldOut);
        assert_eq!(parse_availability("Coming Soon!"), Availability::ComingSoon);
        assert_eq!(parse_availability("<b>Add to basket</b>"), Availability::InStock);
    }

    #[test]
    fn search_results_extract_titles_and_urls() {
        let html = r#"
            <a class="product product-item-link" href="https://www.loaded.com/elden-ring-pc-steam">
                <span>ELDEN RING</span>
            </a>
            <a class="product-item-link" href="https://www.loaded.com/hades-ii-pc-steam">Hades II</a>
            <a class="nav-link" href="/about">About us</a>
        "#;
        let hits = parse_search_results(html);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "ELDEN RING");
        assert_eq!(hits[0].url, "https://www.loaded.com/elden-ring-pc-steam");
        assert_eq!(hits[1].title, "Hades II");
    }
}
