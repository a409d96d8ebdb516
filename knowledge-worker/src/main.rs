use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use knowledge_worker::cache::{RedisStatusCache, StatusCache};
use knowledge_worker::config::AppConfig;
use knowledge_worker::db::Database;
use knowledge_worker::embedding::OllamaEmbedder;
use knowledge_worker::error::format_error_chain;
use knowledge_worker::queue::Worker;
use knowledge_worker::search::ElasticsearchIndex;
use knowledge_worker::task::DocumentProcessor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting knowledge worker v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    info!(
        database = %config.database.redacted_url(),
        broker = %config.broker.redacted_url(),
        cache = %config.cache.redacted_url(),
        embedding = %config.embedding.base_url,
        search = %config.search.url,
        "Configuration loaded"
    );

    // Schema failures are logged and do not stop the worker
    let db = Database::connect(&config.database)?;
    db.init_db().await;

    let embedder = OllamaEmbedder::new(&config.embedding)?;
    if embedder.health_check().await {
        info!(model = %embedder.model(), "Embedding service available");
    } else {
        warn!(
            model = %embedder.model(),
            "Embedding service not reachable, tasks will fail until it is"
        );
    }

    let index = ElasticsearchIndex::new(&config.search)?;
    match index.ensure_index().await {
        Ok(()) => info!(index = %index.index_name(), "Search index ready"),
        Err(e) => warn!(
            index = %index.index_name(),
            error = %format_error_chain(&e),
            "Could not prepare search index"
        ),
    }

    // A cache that is down now is retried on every task
    let cache: Option<Arc<dyn StatusCache>> = match RedisStatusCache::new(&config.cache) {
        Ok(cache) => {
            if let Err(e) = cache.ping().await {
                warn!(
                    error = %format_error_chain(&e),
                    "Status cache not reachable yet, will retry on each task"
                );
            }
            Some(Arc::new(cache))
        }
        Err(e) => {
            warn!(
                error = %format_error_chain(&e),
                "Status cache misconfigured, document status will not be updated"
            );
            None
        }
    };

    let processor = DocumentProcessor::new(Arc::new(embedder), Arc::new(index), cache);
    let worker = Worker::connect(&config.broker, processor).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = worker.run(shutdown).await;

    db.close().await;

    if let Err(e) = result {
        error!(error = %format_error_chain(&e), "Task worker failed");
        return Err(e.into());
    }

    info!("Knowledge worker shut down");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested, finishing current task");
    shutdown.cancel();
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("knowledge_worker=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
