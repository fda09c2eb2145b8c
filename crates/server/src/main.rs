use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tallybook_engine::ScriptRuleBook;
use tallybook_storage::{create_db, seed_script_rules, RuleStore};
use tracing::{info, warn};

mod categorizer;
mod config;
mod error;
mod fallback;
mod routes;
mod state;
mod telemetry;

use categorizer::Categorizer;
use config::ServerConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;
    telemetry::init_tracing(&config.log_format);

    if config.api_key.is_none() {
        warn!("API_KEY is not set; protected routes accept every request");
    }

    let pool = create_db(&config.database_path)
        .await
        .with_context(|| format!("open database {}", config.database_path.display()))?;

    seed_rule_book(&pool, &config.rules_file).await?;

    let store = Arc::new(RuleStore::new(pool, config.cache_ttl()));
    match store.load().await {
        Ok(snapshot) => info!(rules = snapshot.rules.len(), "rule cache warmed"),
        Err(e) => warn!(error = %e, "could not warm rule cache"),
    }

    let ml = Arc::from(fallback::classifier_from_config(&config.ml)?);
    let generator = Arc::from(fallback::generator_from_config(&config.llm));
    let categorizer = Categorizer::new(store, ml, generator, config.ml_threshold);

    let bind = config.bind;
    let app = routes::router(AppState::new(categorizer, config));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "tallybook server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Seeds script rules from the rule book on a fresh database.
async fn seed_rule_book(pool: &tallybook_storage::DbPool, path: &Path) -> Result<()> {
    if !path.exists() {
        warn!(path = %path.display(), "rule book not found, no script rules seeded");
        return Ok(());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let book = ScriptRuleBook::from_toml(&content)
        .with_context(|| format!("parse {}", path.display()))?;
    let drafts = book.drafts()?;
    let seeded = seed_script_rules(pool, &drafts).await?;
    if seeded > 0 {
        info!(seeded, path = %path.display(), "script rules seeded");
    } else {
        info!("script rules already present, skipping seed");
    }
    Ok(())
}
