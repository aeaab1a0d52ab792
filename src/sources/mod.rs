pub mod itad;
pub mod loaded;
pub mod steam;

use async_trait::async_trait;

use crate::fetch::FetchError;
use crate::store::models::{BundleEntry, PriceQuote, ReportedLow, SourceKind, TrackedItem};

/// Everything one source reported for one item in one fetch. Bundles and
/// reported lows are only ever populated by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub quotes: Vec<PriceQuote>,
    pub bundles: Vec<BundleEntry>,
    pub reported_lows: Vec<ReportedLow>,
}

/// The tracked-item list provider. One implementation talks to Steam; the
/// orchestrator only depends on this seam.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn sync(&self, db: &crate::store::db::Db) -> anyhow::Result<Vec<TrackedItem>>;
}

/// Per-source fetch + normalization into the common quote shape. Adding a
/// store means adding an implementation, not branching in shared code.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;
    fn name(&self) -> &'static str;

    /// Zero quotes is a valid outcome: the item is simply absent from this
    /// source's index. Every quote carries the store label and an
    /// `observed_at` stamped at fetch completion.
    async fn fetch_prices(&self, item: &TrackedItem) -> Result<SourceBatch, FetchError>;
}
