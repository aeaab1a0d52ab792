use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use wishlist_watch::logging::init_tracing;
use wishlist_watch::sources::itad::ItadAdapter;
use wishlist_watch::sources::loaded::LoadedAdapter;
use wishlist_watch::sources::steam::{SteamCatalog, SteamStoreAdapter};
use wishlist_watch::sources::SourceAdapter;
use wishlist_watch::store::db::Db;
use wishlist_watch::store::queries::DealsFilter;
use wishlist_watch::sync::SyncOrchestrator;
use wishlist_watch::util::env;

#[derive(Parser, Debug)]
#[command(name = "wishlist-watch", version, about = "Steam wishlist price tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run a full sync: wishlist, then every price source
    Sync {
        /// SteamID64 of the wishlist to track (env: STEAM_ID)
        #[arg(long)]
        steam_id: Option<String>,
        /// Steam Web API key (env: STEAM_API_KEY)
        #[arg(long)]
        steam_key: Option<String>,
        /// IsThereAnyDeal API key (env: ITAD_API_KEY)
        #[arg(long)]
        itad_key: Option<String>,
        /// Two-letter country for regional pricing
        #[arg(long, default_value = "GB")]
        country: String,
        /// Skip the scraped storefront
        #[arg(long, default_value_t = false)]
        skip_scrape: bool,
        /// Items fetched concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Show the best current offer per wishlisted game
    Report {
        /// Only games currently discounted
        #[arg(long, default_value_t = false)]
        on_sale: bool,
        /// Minimum discount percentage
        #[arg(long)]
        min_discount: Option<i64>,
    },
    /// Show one game in full: prices, lows, history, bundles
    Game {
        app_id: i64,
    },
    /// List tracked games
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("wishlist_watch=info,sqlx=warn")?;
    let cli = Cli::parse();

    let db_url = env::db_url()?;
    let max_conns: u32 = env::env_parse("DB_MAX_CONNS", 5);
    let db = Db::connect(&db_url, max_conns)
        .await
        .context("database connect failed")?;

    match cli.command {
        Commands::Sync {
            steam_id,
            steam_key,
            itad_key,
            country,
            skip_scrape,
            concurrency,
        } => {
            let steam_id = match steam_id {
                Some(id) => id,
                None => env::env_req("STEAM_ID").context("pass --steam-id or set STEAM_ID")?,
            };
            let steam_key = match steam_key {
                Some(key) => key,
                None => {
                    env::env_req("STEAM_API_KEY").context("pass --steam-key or set STEAM_API_KEY")?
                }
            };
            let itad_key = itad_key.or_else(|| env::env_opt("ITAD_API_KEY"));

            run_sync(db, steam_id, steam_key, itad_key, country, skip_scrape, concurrency).await
        }
        Commands::Report { on_sale, min_discount } => {
            print_report(&db, DealsFilter { on_sale, min_discount }).await
        }
        Commands::Game { app_id } => print_game(&db, app_id).await,
        Commands::List => print_list(&db).await,
    }
}

async fn run_sync(
    db: Db,
    steam_id: String,
    steam_key: String,
    itad_key: Option<String>,
    country: String,
    skip_scrape: bool,
    concurrency: usize,
) -> Result<()> {
    let currency = "GBP".to_string();
    let catalog = SteamCatalog::new(steam_id, steam_key, country.clone())?;

    let mut adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(SteamStoreAdapter)];
    match itad_key {
        Some(key) => adapters.push(Arc::new(ItadAdapter::new(
            db.clone(),
            key,
            country,
            currency.clone(),
        )?)),
        None => warn!("no ITAD key configured; aggregator source disabled"),
    }
    if skip_scrape {
        info!("scraped storefront disabled by flag");
    } else {
        adapters.push(Arc::new(LoadedAdapter::new(db.clone(), currency)?));
    }

    let orchestrator = SyncOrchestrator::new(db, Box::new(catalog), adapters, concurrency);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current items");
            let _ = cancel_tx.send(true);
        }
    });

    let run = orchestrator.run(cancel_rx).await?;
    println!(
        "sync {:?}: {}/{} items in {}s",
        run.status,
        run.items_processed,
        run.items_total,
        (run.finished_at - run.started_at).num_seconds()
    );
    for (source, tally) in &run.per_source {
        println!(
            "  {source:<12} fetched {:>4}  failed {:>3}  skipped {:>3}",
            tally.fetched, tally.failed, tally.skipped
        );
    }
    Ok(())
}

fn fmt_price(minor: i64, currency: &str) -> String {
    let symbol = match currency {
        "GBP" => "£",
        "EUR" => "€",
        "USD" => "$",
        _ => "",
    };
    if symbol.is_empty() {
        format!("{}.{:02} {currency}", minor / 100, minor % 100)
    } else {
        format!("{symbol}{}.{:02}", minor / 100, minor % 100)
    }
}

async fn print_report(db: &Db, filter: DealsFilter) -> Result<()> {
    let rows = db.get_deals_report(filter).await?;
    if rows.is_empty() {
        println!("no offers recorded yet; run `wishlist-watch sync` first");
        return Ok(());
    }
    let total = rows.len();
    let on_sale_count = rows.iter().filter(|r| r.discount_pct > 0).count();
    // "near": within 5% of the recorded low.
    let near_low = rows
        .iter()
        .filter(|r| {
            r.low_minor
                .is_some_and(|low| r.price_minor * 100 <= low * 105)
        })
        .count();

    for row in rows {
        let low_marker = if row.at_historic_low() { "  <- historic low" } else { "" };
        let bundles = if row.bundle_count > 0 {
            format!("  [{} bundle(s)]", row.bundle_count)
        } else {
            String::new()
        };
        println!(
            "{:>8}  {:<40} {:>9} @ {:<8} -{:>3}%{}{}",
            row.app_id,
            row.title,
            fmt_price(row.price_minor, &row.currency),
            row.store,
            row.discount_pct,
            bundles,
            low_marker,
        );
    }
    println!("{total} priced, {on_sale_count} on sale, {near_low} at or near their historic low");
    Ok(())
}

async fn print_game(db: &Db, app_id: i64) -> Result<()> {
    let Some(item) = db.get_item(app_id).await? else {
        println!("app {app_id} is not tracked");
        return Ok(());
    };
    println!("{} ({})", item.title, item.app_id);
    if let Some(url) = &item.steam_url {
        println!("  {url}");
    }

    println!("current prices:");
    let prices = db.get_current_prices(app_id).await?;
    if prices.is_empty() {
        println!("  (none recorded)");
    }
    for p in &prices {
        println!(
            "  {:<10} {:>9} (was {}, -{}%) {} @ {}",
            p.store,
            fmt_price(p.price_minor, &p.currency),
            fmt_price(p.regular_minor, &p.currency),
            p.discount_pct,
            p.availability.as_str(),
            p.observed_at.format("%Y-%m-%d %H:%M"),
        );
    }

    let lows = db.get_historic_lows(app_id).await?;
    if !lows.is_empty() {
        println!("historic lows:");
        for l in &lows {
            println!(
                "  {:<10} {:>9} on {}",
                l.store,
                fmt_price(l.price_minor, &l.currency),
                l.recorded_at.format("%Y-%m-%d"),
            );
        }
    }

    let history = db.get_history(app_id, None, None).await?;
    if !history.is_empty() {
        println!("price changes (latest 10):");
        for h in history.iter().take(10) {
            println!(
                "  {}  {:<10} {:>9} (-{}%)",
                h.recorded_at.format("%Y-%m-%d %H:%M"),
                h.store,
                fmt_price(h.price_minor, &h.currency),
                h.discount_pct,
            );
        }
    }

    let bundles = db.get_bundles(app_id).await?;
    if !bundles.is_empty() {
        println!("bundle appearances:");
        for b in &bundles {
            let price = b
                .price_minor
                .map(|m| fmt_price(m, &b.currency))
                .unwrap_or_else(|| "?".to_string());
            println!("  {} @ {} ({})", b.bundle_title, b.store, price);
        }
    }
    Ok(())
}

async fn print_list(db: &Db) -> Result<()> {
    let items = db.get_items().await?;
    for item in items {
        let flag = if item.wishlisted { " " } else { "-" };
        let checked = item
            .last_checked_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("{flag} {:>8}  {:<40} last checked {checked}", item.app_id, item.title);
    }
    Ok(())
}
