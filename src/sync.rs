//! Drives a full synchronization run: catalog first, then every price
//! source for every tracked item, feeding reconciliation and history.
//!
//! Failure isolation is the organizing rule here. A source that errors on
//! one item affects neither other sources for that item nor other items;
//! only a failed catalog sync aborts the run, because without the item list
//! nothing downstream is meaningful.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tracing::{info, instrument, warn};

use crate::bundles::BundleDetector;
use crate::fetch::FetchError;
use crate::history::HistoryLedger;
use crate::reconcile::{ConflictError, Reconciler};
use crate::sources::{CatalogSource, SourceAdapter, SourceBatch};
use crate::store::db::Db;
use crate::store::models::{PriceQuote, SourceKind, TrackedItem};

/// Per-source counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceTally {
    /// Items this source answered for, including "not listed here".
    pub fetched: usize,
    /// Items where the source errored after retries.
    pub failed: usize,
    /// Items not attempted because the source was rate limited earlier
    /// in the run.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Completed,
    Cancelled,
}

/// Summary of one finished run, cancelled or not.
#[derive(Debug)]
pub struct SyncRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_total: usize,
    pub items_processed: usize,
    pub per_source: BTreeMap<String, SourceTally>,
    pub status: SyncStatus,
}

/// Shared progress counters, readable while a run is in flight.
#[derive(Default)]
pub struct SyncProgress {
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl SyncProgress {
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

pub struct SyncOrchestrator {
    db: Db,
    catalog: Box<dyn CatalogSource>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    reconciler: Reconciler,
    ledger: HistoryLedger,
    bundles: BundleDetector,
    // Held for the duration of a run; try_lock makes overlap an error
    // instead of a queue.
    run_lock: AsyncMutex<()>,
    // Scraped stores get one request in flight across the whole run,
    // whatever the item-level concurrency is.
    scrape_slot: Semaphore,
    progress: SyncProgress,
    max_concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        db: Db,
        catalog: Box<dyn CatalogSource>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        max_concurrency: usize,
    ) -> Self {
        let reconciler = Reconciler::new(db.clone());
        let ledger = HistoryLedger::new(db.clone());
        let bundles = BundleDetector::new(db.clone());
        Self {
            db,
            catalog,
            adapters,
            reconciler,
            ledger,
            bundles,
            run_lock: AsyncMutex::new(()),
            scrape_slot: Semaphore::new(1),
            progress: SyncProgress::default(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Execute one run. `cancel` flips to `true` to request a stop; items
    /// already mid-flight are dropped, everything committed so far stays.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<SyncRun> {
        let _run_guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("a sync run is already active"))?;

        let started_at = Utc::now();
        let items = self
            .catalog
            .sync(&self.db)
            .await
            .context("catalog sync failed, aborting run")?;
        info!(items = items.len(), "catalog synced, fetching prices");

        self.progress.total.store(items.len(), Ordering::Relaxed);
        self.progress.processed.store(0, Ordering::Relaxed);

        let items_total = items.len();
        let tallies: Mutex<BTreeMap<String, SourceTally>> = Mutex::new(BTreeMap::new());
        let rate_limited: Mutex<HashSet<&'static str>> = Mutex::new(HashSet::new());

        let stop = {
            let mut rx = cancel.clone();
            async move {
                loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone means nobody can cancel any more.
                        std::future::pending::<()>().await;
                    }
                }
            }
        };

        let done: Vec<()> = stream::iter(
            items
                .into_iter()
                .map(|item| self.process_item(item, &tallies, &rate_limited, cancel.clone())),
        )
        .buffer_unordered(self.max_concurrency)
        .take_until(stop)
        .collect()
        .await;

        let status = if *cancel.borrow() {
            info!("run cancelled, in-flight fetches dropped");
            SyncStatus::Cancelled
        } else {
            SyncStatus::Completed
        };

        let per_source = tallies
            .into_inner()
            .map_err(|_| anyhow!("tally lock poisoned"))?;
        let run = SyncRun {
            started_at,
            finished_at: Utc::now(),
            items_total,
            items_processed: done.len(),
            per_source,
            status,
        };
        info!(
            processed = run.items_processed,
            total = run.items_total,
            cancelled = run.status == SyncStatus::Cancelled,
            "sync run finished"
        );
        Ok(run)
    }

    /// Walk every adapter for one item, sequentially. Sequential per item
    /// keeps a single writer per (item, store) key; parallelism comes from
    /// running many items at once.
    async fn process_item(
        &self,
        item: TrackedItem,
        tallies: &Mutex<BTreeMap<String, SourceTally>>,
        rate_limited: &Mutex<HashSet<&'static str>>,
        cancel: watch::Receiver<bool>,
    ) {
        for adapter in &self.adapters {
            if *cancel.borrow() {
                return;
            }
            let name = adapter.name();
            let limited = match rate_limited.lock() {
                Ok(set) => set.contains(name),
                Err(_) => false,
            };
            if limited {
                bump(tallies, name, |t| t.skipped += 1);
                continue;
            }

            let _permit = if adapter.kind() == SourceKind::ScrapedStore {
                self.scrape_slot.acquire().await.ok()
            } else {
                None
            };

            match adapter.fetch_prices(&item).await {
                Ok(batch) => {
                    bump(tallies, name, |t| t.fetched += 1);
                    self.apply_batch(&item, &batch).await;
                }
                Err(FetchError::ItemNotFound) => {
                    // Absence from a source's index is an answer, not a fault.
                    bump(tallies, name, |t| t.fetched += 1);
                }
                Err(FetchError::RateLimited { cooldown }) => {
                    warn!(
                        source = name,
                        cooldown_secs = cooldown.map(|d| d.as_secs()),
                        "source rate limited, skipping it for the rest of the run"
                    );
                    if let Ok(mut set) = rate_limited.lock() {
                        set.insert(name);
                    }
                    bump(tallies, name, |t| t.skipped += 1);
                }
                Err(e) => {
                    warn!(
                        source = name,
                        app_id = item.app_id,
                        error = %e,
                        "price fetch failed, other sources unaffected"
                    );
                    bump(tallies, name, |t| t.failed += 1);
                }
            }
        }

        if let Err(e) = self.db.mark_checked(item.app_id).await {
            warn!(app_id = item.app_id, error = %e, "failed to stamp last_checked");
        }
        self.progress.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconcile one quote and record its history in a single transaction.
    /// A cancellation or error anywhere in between rolls back the canonical
    /// row as well, so the price change is re-detected on the next run
    /// instead of silently vanishing from the history log.
    async fn apply_quote(&self, quote: &PriceQuote) -> Result<()> {
        let mut tx = self.db.pool.begin().await?;
        let outcome = self.reconciler.reconcile_in(&mut tx, quote).await?;
        self.ledger.record_in(&mut tx, quote, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist one source's answer for one item. Write failures are logged
    /// and contained; the run keeps going.
    async fn apply_batch(&self, item: &TrackedItem, batch: &SourceBatch) {
        for quote in &batch.quotes {
            match self.apply_quote(quote).await {
                Ok(()) => {}
                Err(e) if e.downcast_ref::<ConflictError>().is_some() => {
                    warn!(
                        app_id = quote.app_id,
                        store = %quote.store,
                        error = %e,
                        "rejected conflicting observation, canonical row kept"
                    );
                }
                Err(e) => {
                    warn!(
                        app_id = quote.app_id,
                        store = %quote.store,
                        error = %e,
                        "price write failed"
                    );
                }
            }
        }

        // Reported lows stay outside the quote transactions: the lowering
        // path is monotonic, so a lost write is re-applied next run.
        for low in &batch.reported_lows {

            if let Err(e) = self.ledger.record_reported_low(low).await {
                warn!(app_id = low.app_id, store = %low.store, error = %e, "reported-low write failed");
            }
        }

        if !batch.bundles.is_empty() {
            match self.bundles.record_bundles(item.app_id, &batch.bundles).await {
                Ok(0) => {}
                Ok(n) => info!(app_id = item.app_id, new = n, "recorded new bundle appearances"),
                Err(e) => warn!(app_id = item.app_id, error = %e, "bundle write failed"),
            }
        }
    }
}

fn bump(
    tallies: &Mutex<BTreeMap<String, SourceTally>>,
    source: &str,
    f: impl FnOnce(&mut SourceTally),
) {
    if let Ok(mut map) = tallies.lock() {
        f(map.entry(source.to_string()).or_default());
    }
}
