use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::Router;
use chatgate::{
    api,
    config::Config,
    gateway::{spawn_fanout, Gateway},
    ingest::IngestionWorker,
    presence::{MemoryPresence, PresenceStore, PresenceTracker, RedisPresence},
    queue::{AmqpQueue, DurableQueue, MemoryQueue},
    relay::{MemoryRelay, RedisRelay, RelayBus},
    store::Store,
    AppState,
};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    let _log_guard = chatgate::logging::init_tracing(config.log.as_deref(), config.log_dir.as_deref())?;

    let store = Store::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("cannot open database {}", config.database_url))?;

    let (relay, presence_store): (Arc<dyn RelayBus>, Arc<dyn PresenceStore>) = match &config.redis_url {
        Some(url) => (
            Arc::new(RedisRelay::connect(url).await.context("cannot reach redis relay")?),
            Arc::new(RedisPresence::connect(url).await.context("cannot reach redis presence")?),
        ),
        None => {
            tracing::warn!("no REDIS_URL, relay and presence are process-local");
            (Arc::new(MemoryRelay::new()), Arc::new(MemoryPresence::new()))
        }
    };

    let queue: Arc<dyn DurableQueue> = match &config.amqp_url {
        Some(url) => Arc::new(
            AmqpQueue::connect(url, config.prefetch)
                .await
                .context("cannot reach amqp broker")?,
        ),
        None => {
            tracing::warn!("no AMQP_URL, queues are process-local");
            Arc::new(MemoryQueue::new())
        }
    };

    let presence = PresenceTracker::new(presence_store.clone(), relay.clone());
    let gateway = Gateway::new(
        relay.clone(),
        queue.clone(),
        presence.clone(),
        Arc::new(store.clone()),
        config.gateway(),
    );
    spawn_fanout(gateway.clone());

    if config.no_worker {
        tracing::info!("ingestion worker disabled");
    } else {
        let worker = IngestionWorker::new(
            store.clone(),
            queue.clone(),
            presence_store,
            config.ingest_partitions,
        );
        tokio::spawn(async move {
            if let Err(err) = worker.run().await {
                tracing::error!(%err, "ingestion worker stopped");
            }
        });
    }

    let app_state = AppState {
        store,
        relay,
        queue,
        presence,
        gateway,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .merge(Gateway::router())
        .merge(api::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
