use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the three structurally different providers a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// The wishlist provider itself (Steam).
    Catalog,
    /// The multi-store deal aggregator (IsThereAnyDeal).
    Aggregator,
    /// A single retailer scraped from HTML (loaded.com).
    ScrapedStore,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Catalog => "catalog",
            SourceKind::Aggregator => "aggregator",
            SourceKind::ScrapedStore => "scraped-store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    InStock,
    SoldOut,
    ComingSoon,
    Unknown,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "in_stock",
            Availability::SoldOut => "sold_out",
            Availability::ComingSoon => "coming_soon",
            Availability::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "in_stock" => Availability::InStock,
            "sold_out" => Availability::SoldOut,
            "coming_soon" => Availability::ComingSoon,
            _ => Availability::Unknown,
        }
    }
}

/// A game being monitored. Created on catalog sync, never deleted automatically;
/// games removed from the remote wishlist keep their rows with `wishlisted = false`.
#[derive(Debug, Clone)]
pub struct TrackedItem {
    pub app_id: i64,
    pub title: String,
    pub steam_url: Option<String>,
    pub header_image: Option<String>,
    /// Cached aggregator UUID; looked up once, then reused across runs.
    pub itad_id: Option<String>,
    /// Cached scraped-store product URL, resolved by search once.
    pub loaded_url: Option<String>,
    pub wishlisted: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// A single normalized price observation from one source for one item.
/// Prices are minor units (pence) in the single fixed target currency.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub app_id: i64,
    pub store: String,
    pub kind: SourceKind,
    pub price_minor: i64,
    pub regular_minor: i64,
    pub currency: String,
    pub discount_pct: i64,
    pub availability: Availability,
    pub url: Option<String>,
    /// Taken at fetch completion, not request start.
    pub observed_at: DateTime<Utc>,
}

/// Latest accepted quote per (item, store). Mutated in place by the reconciler.
#[derive(Debug, Clone)]
pub struct CurrentPrice {
    pub app_id: i64,
    pub store: String,
    pub price_minor: i64,
    pub regular_minor: i64,
    pub currency: String,
    pub discount_pct: i64,
    pub availability: Availability,
    pub url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Append-only log row; written only for `New`/`Updated` reconcile outcomes.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub app_id: i64,
    pub store: String,
    pub price_minor: i64,
    pub currency: String,
    pub discount_pct: i64,
    pub availability: Availability,
    pub recorded_at: DateTime<Utc>,
}

/// Minimum price ever seen for (item, store). Only ever lowered.
#[derive(Debug, Clone)]
pub struct HistoricLow {
    pub app_id: i64,
    pub store: String,
    pub price_minor: i64,
    pub currency: String,
    pub discount_pct: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Bundle membership as reported by the aggregator, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntry {
    pub title: String,
    pub store: String,
    /// Cheapest tier containing the item, when priced.
    pub price_minor: Option<i64>,
    pub currency: String,
    pub url: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BundleAppearance {
    pub app_id: i64,
    pub bundle_title: String,
    pub store: String,
    pub price_minor: Option<i64>,
    pub currency: String,
    pub url: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

/// An aggregator-reported all-time low for one store. Folded into
/// `historic_lows` through the same monotonic lowering path as observed
/// quotes, but never appended to price history (it is not an observation).
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedLow {
    pub app_id: i64,
    pub store: String,
    pub price_minor: i64,
    pub currency: String,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    New,
    Updated,
    Unchanged,
}

/// Round a decimal amount in the target currency to minor units (pence).
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Discount is always derived, never trusted from upstream: upstream `cut`
/// fields routinely disagree with their own price pairs.
pub fn derive_discount(price_minor: i64, regular_minor: i64) -> i64 {
    if regular_minor <= 0 {
        return 0;
    }
    let pct = (100.0 * (1.0 - price_minor as f64 / regular_minor as f64)).round() as i64;
    pct.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_derivation() {
        assert_eq!(derive_discount(999, 1999), 50);
        assert_eq!(derive_discount(1200, 1200), 0);
        assert_eq!(derive_discount(500, 0), 0);
        // Price above regular never yields a negative discount.
        assert_eq!(derive_discount(2500, 1999), 0);
        assert_eq!(derive_discount(0, 1999), 100);
    }

    #[test]
    fn minor_unit_rounding() {
        assert_eq!(to_minor_units(9.99), 999);
        assert_eq!(to_minor_units(12.0), 1200);
        assert_eq!(to_minor_units(0.005), 1);
    }

    #[test]
    fn availability_round_trips_and_tolerates_junk() {
        for a in [
            Availability::InStock,
            Availability::SoldOut,
            Availability::ComingSoon,
            Availability::Unknown,
        ] {
            assert_eq!(Availability::parse(a.as_str()), a);
        }
        assert_eq!(Availability::parse("preorder?"), Availability::Unknown);
    }
}
