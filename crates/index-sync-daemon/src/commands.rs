//! Command implementations for index-sync.
//!
//! Handles:
//! - reconcile: Compare two metadata dumps offline
//! - bookmark: Show or reset the background sync bookmark
//! - config: Print the effective settings

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use index_sync_reconcile::{BookmarkStore, JsonFileBookmarkStore, Reconciler};
use index_sync_types::{Bookmark, Metadata, ReindexRequest, Settings};
use tracing::info;

/// Load settings and apply the CLI overrides shared by every command.
pub fn load_settings(config_path: Option<&str>, log_level_override: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the global tracing subscriber. Logs go to stderr so that command
/// output on stdout stays machine readable.
pub fn init_tracing(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Compare a dump of the authoritative store with a dump of the index.
pub async fn run_reconcile(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    persisted: &Path,
    indexed: &Path,
    tolerance_override: Option<u64>,
) -> Result<()> {
    let mut settings = load_settings(config_path, log_level_override)?;
    if let Some(tolerance_secs) = tolerance_override {
        settings.background_sync.tolerance_window_secs = tolerance_secs;
    }
    init_tracing(&settings.log_level)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let found = reconcile_dumps(
        persisted,
        indexed,
        settings.background_sync.tolerance_window(),
        &mut out,
    )
    .await?;

    info!(inconsistencies = found, "Reconciliation finished");
    Ok(())
}

/// Write one JSON re-index request per inconsistency to `out`.
///
/// Dumps hold one metadata object per line and need not be sorted. Returns
/// the number of inconsistencies found.
pub async fn reconcile_dumps(
    persisted: &Path,
    indexed: &Path,
    tolerance_window: Duration,
    out: &mut impl Write,
) -> Result<usize> {
    let persisted = read_dump(persisted)?;
    let indexed = read_dump(indexed)?;
    info!(
        persisted = persisted.len(),
        indexed = indexed.len(),
        "Loaded metadata dumps"
    );

    let as_scan = |items: Vec<Metadata>| {
        stream::iter(items.into_iter().map(Ok::<_, std::convert::Infallible>)).boxed()
    };
    let mut inconsistencies =
        Reconciler::new(tolerance_window).inconsistencies(as_scan(persisted), as_scan(indexed));

    let mut found = 0;
    while let Some(Ok(metadata)) = inconsistencies.next().await {
        let request = ReindexRequest::from(&metadata);
        serde_json::to_writer(&mut *out, &request)?;
        writeln!(out)?;
        found += 1;
    }
    Ok(found)
}

fn read_dump(path: &Path) -> Result<Vec<Metadata>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut items = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let metadata: Metadata = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid metadata", path.display(), index + 1))?;
        items.push(metadata);
    }
    items.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
    Ok(items)
}

fn bookmark_store(settings: &Settings, path_override: Option<&str>) -> JsonFileBookmarkStore {
    JsonFileBookmarkStore::new(path_override.unwrap_or(settings.bookmark_path.as_str()))
}

/// Print the persisted bookmark as JSON.
pub async fn show_bookmark(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    path_override: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override)?;
    init_tracing(&settings.log_level)?;

    let store = bookmark_store(&settings, path_override);
    match store.get().await.context("Failed to read bookmark")? {
        Some(bookmark) => println!("{}", serde_json::to_string_pretty(&bookmark)?),
        None => println!("No bookmark at {}", store.path().display()),
    }
    Ok(())
}

/// Overwrite the bookmark with the empty key.
pub async fn reset_bookmark(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    path_override: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override)?;
    init_tracing(&settings.log_level)?;

    let store = bookmark_store(&settings, path_override);
    store
        .set(&Bookmark::empty())
        .await
        .context("Failed to reset bookmark")?;
    info!(path = %store.path().display(), "Bookmark reset");
    println!("Bookmark reset at {}", store.path().display());
    Ok(())
}

/// Print the effective configuration as TOML.
pub fn show_config(config_path: Option<&str>) -> Result<()> {
    let settings = load_settings(config_path, None)?;
    let rendered = toml::to_string_pretty(&settings).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
