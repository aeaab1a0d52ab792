//! End-to-end sync runs against an in-memory database, with scripted
//! sources standing in for the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use wishlist_watch::fetch::FetchError;
use wishlist_watch::sources::{CatalogSource, SourceAdapter, SourceBatch};
use wishlist_watch::store::db::Db;
use wishlist_watch::store::models::{
    derive_discount, Availability, PriceQuote, SourceKind, TrackedItem,
};
use wishlist_watch::sync::{SyncOrchestrator, SyncStatus};

struct FakeCatalog {
    games: Vec<(i64, &'static str)>,
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn sync(&self, db: &Db) -> anyhow::Result<Vec<TrackedItem>> {
        for (app_id, title) in &self.games {
            db.upsert_item(*app_id, title, None, None).await?;
        }
        db.get_items().await
    }
}

/// Always answers with one quote at a fixed price.
struct FixedPriceAdapter {
    name: &'static str,
    price_minor: i64,
    regular_minor: i64,
}

#[async_trait]
impl SourceAdapter for FixedPriceAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Aggregator
    }

    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_prices(&self, item: &TrackedItem) -> Result<SourceBatch, FetchError> {
        Ok(SourceBatch {
            quotes: vec![PriceQuote {
                app_id: item.app_id,
                store: self.name.to_string(),
                kind: SourceKind::Aggregator,
                price_minor: self.price_minor,
                regular_minor: self.regular_minor,
                currency: "GBP".to_string(),
                discount_pct: derive_discount(self.price_minor, self.regular_minor),
                availability: Availability::InStock,
                url: None,
                observed_at: Utc::now(),
            }],
            ..Default::default()
        })
    }
}

/// Fails every call with a fabricated error, counting attempts.
struct FailingAdapter {
    name: &'static str,
    error: fn() -> FetchError,
    calls: AtomicUsize,
}

impl FailingAdapter {
    fn new(name: &'static str, error: fn() -> FetchError) -> Self {
        Self {
            name,
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::ScrapedStore
    }

    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_prices(&self, _item: &TrackedItem) -> Result<SourceBatch, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

fn not_cancelled() -> watch::Receiver<bool> {
    // Dropping the sender is fine: the run treats a closed channel as
    // "cannot be cancelled any more".
    let (_tx, rx) = watch::channel(false);
    rx
}

#[tokio::test]
async fn two_sources_produce_prices_history_and_lows() {
    let db = Db::open_in_memory().await.unwrap();
    let catalog = FakeCatalog {
        games: vec![(100, "Hollow Knight")],
    };
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(FixedPriceAdapter {
            name: "store-a",
            price_minor: 999,
            regular_minor: 1999,
        }),
        Arc::new(FixedPriceAdapter {
            name: "store-b",
            price_minor: 1200,
            regular_minor: 1200,
        }),
    ];
    let orchestrator = SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters, 4);

    let run = orchestrator.run(not_cancelled()).await.unwrap();
    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.items_total, 1);
    assert_eq!(run.items_processed, 1);
    assert_eq!(run.per_source["store-a"].fetched, 1);
    assert_eq!(run.per_source["store-b"].fetched, 1);

    let prices = db.get_current_prices(100).await.unwrap();
    assert_eq!(prices.len(), 2);
    assert_eq!(prices[0].store, "store-a");
    assert_eq!(prices[0].price_minor, 999);
    assert_eq!(prices[0].discount_pct, 50);
    assert_eq!(prices[1].store, "store-b");
    assert_eq!(prices[1].price_minor, 1200);

    let lows = db.get_historic_lows(100).await.unwrap();
    assert_eq!(lows.len(), 2);
    assert_eq!(lows[0].price_minor, 999);
    assert_eq!(lows[1].price_minor, 1200);

    // Both observations were new, so both hit the history log.
    let history = db.get_history(100, None, None).await.unwrap();
    assert_eq!(history.len(), 2);

    let item = db.get_item(100).await.unwrap().unwrap();
    assert!(item.last_checked_at.is_some());
}

#[tokio::test]
async fn one_failing_source_does_not_block_the_others() {
    let db = Db::open_in_memory().await.unwrap();
    let catalog = FakeCatalog {
        games: vec![(100, "Hollow Knight")],
    };
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(FailingAdapter::new("flaky-shop", || {
            FetchError::SourceUnavailable("shop fell over".to_string())
        })),
        Arc::new(FixedPriceAdapter {
            name: "store-b",
            price_minor: 1500,
            regular_minor: 1500,
        }),
    ];
    let orchestrator = SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters, 4);

    let run = orchestrator.run(not_cancelled()).await.unwrap();
    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.per_source["flaky-shop"].failed, 1);
    assert_eq!(run.per_source["store-b"].fetched, 1);

    let prices = db.get_current_prices(100).await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].store, "store-b");
}

#[tokio::test]
async fn rate_limited_source_is_skipped_for_the_rest_of_the_run() {
    let db = Db::open_in_memory().await.unwrap();
    let catalog = FakeCatalog {
        games: vec![(1, "A"), (2, "B"), (3, "C")],
    };
    let limited = Arc::new(FailingAdapter::new("grumpy-shop", || {
        FetchError::RateLimited { cooldown: None }
    }));
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![limited.clone()];
    // Sequential items so the skip decision is deterministic.
    let orchestrator = SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters, 1);

    let run = orchestrator.run(not_cancelled()).await.unwrap();
    assert_eq!(run.status, SyncStatus::Completed);
    assert_eq!(run.items_processed, 3);
    assert_eq!(run.per_source["grumpy-shop"].skipped, 3);
    // Only the first item reached the adapter at all.
    assert_eq!(limited.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_listing_is_an_answer_not_a_failure() {
    let db = Db::open_in_memory().await.unwrap();
    let catalog = FakeCatalog {
        games: vec![(100, "Hollow Knight")],
    };
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(FailingAdapter::new(
        "sparse-shop",
        || FetchError::ItemNotFound,
    ))];
    let orchestrator = SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters, 4);

    let run = orchestrator.run(not_cancelled()).await.unwrap();
    assert_eq!(run.per_source["sparse-shop"].fetched, 1);
    assert_eq!(run.per_source["sparse-shop"].failed, 0);
    assert!(db.get_current_prices(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn pre_cancelled_run_touches_nothing_after_catalog() {
    let db = Db::open_in_memory().await.unwrap();
    let catalog = FakeCatalog {
        games: vec![(1, "A"), (2, "B")],
    };
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(FixedPriceAdapter {
        name: "store-a",
        price_minor: 999,
        regular_minor: 999,
    })];
    let orchestrator = SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters, 4);

    let (tx, rx) = watch::channel(true);
    let run = orchestrator.run(rx).await.unwrap();
    drop(tx);

    assert_eq!(run.status, SyncStatus::Cancelled);
    assert_eq!(run.items_processed, 0);
    assert!(db.get_current_prices(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeat_run_with_unchanged_prices_adds_no_history() {
    let db = Db::open_in_memory().await.unwrap();
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(FixedPriceAdapter {
        name: "store-a",
        price_minor: 999,
        regular_minor: 1999,
    })];

    for _ in 0..2 {
        let catalog = FakeCatalog {
            games: vec![(100, "Hollow Knight")],
        };
        let orchestrator =
            SyncOrchestrator::new(db.clone(), Box::new(catalog), adapters.clone(), 4);
        let run = orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(run.status, SyncStatus::Completed);
    }

    let history = db.get_history(100, None, None).await.unwrap();
    assert_eq!(history.len(), 1);
    let prices = db.get_current_prices(100).await.unwrap();
    assert_eq!(prices.len(), 1);
}
