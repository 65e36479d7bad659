use anyhow::Context;
use book_recommendation_service::consumers::EventConsumer;
use book_recommendation_service::models::Book;
use book_recommendation_service::{Config, HttpScoringOracle, RecommendationEngine, ScoringOracle};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load config")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.service.log_format.as_deref() == Some("json") {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    info!("Starting {}", config.service.service_name);

    let books = load_catalog(config.service.catalog_path.as_deref()).await?;

    let oracle: Option<Arc<dyn ScoringOracle>> = match &config.oracle.url {
        Some(url) => {
            let oracle = HttpScoringOracle::new(url.clone(), config.orchestration.oracle_timeout())?;
            info!(url = %url, "Scoring oracle enabled");
            Some(Arc::new(oracle))
        }
        None => {
            warn!("ORACLE_URL not set - personalized scores use the dot-product baseline only");
            None
        }
    };

    let engine = Arc::new(RecommendationEngine::new(config, books, oracle));
    let consumer = EventConsumer::new(engine);

    let stats = consumer
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
    info!(
        processed = stats.processed,
        dropped = stats.dropped,
        "Shutting down"
    );
    Ok(())
}

async fn load_catalog(path: Option<&str>) -> anyhow::Result<Vec<Book>> {
    let Some(path) = path else {
        warn!("CATALOG_PATH not set - starting with an empty catalog");
        return Ok(Vec::new());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read catalog {}", path))?;
    let books: Vec<Book> =
        serde_json::from_str(&raw).with_context(|| format!("Malformed catalog {}", path))?;

    info!(books = books.len(), path = %path, "Catalog loaded");
    Ok(books)
}
