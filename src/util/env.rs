//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in the binary (or rely on lazy Once).
use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Database URL from `WISHLIST_DB`, defaulting to `sqlite://data/wishlist.db`.
/// Creates the parent directory for the file-backed default so a first run
/// works without any setup.
pub fn db_url() -> anyhow::Result<String> {
    init_env();
    if let Some(url) = env_opt("WISHLIST_DB") {
        return Ok(url);
    }
    let dir = Path::new("data");
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok("sqlite://data/wishlist.db".to_string())
}
