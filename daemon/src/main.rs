use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};

use tally_daemon::config::{Config, DISPATCH_QUEUE_DEPTH};
use tally_daemon::core::cache::MemoryCache;
use tally_daemon::core::engine::Ledger;
use tally_daemon::core::idempotency::IdempotencyKeeper;
use tally_daemon::core::lock::PendingLocks;
use tally_daemon::core::queue::{spawn_consumer, Broker, MemoryBroker};
use tally_daemon::core::storage::SledStorage;
use tally_daemon::rpc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let metrics_handle = if config.disable_metrics {
        None
    } else {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("failed to install the metrics recorder")?,
        )
    };

    let storage = SledStorage::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let cache = Arc::new(MemoryCache::new());
    let idempotency = IdempotencyKeeper::new(cache.clone());
    let pending_locks = PendingLocks::new(cache.clone());

    let (broker, receiver): (
        Option<Arc<dyn Broker>>,
        Option<mpsc::Receiver<Vec<u8>>>,
    ) = if config.async_dispatch {
        info!("async dispatch enabled");
        let (broker, receiver) = MemoryBroker::new(DISPATCH_QUEUE_DEPTH);
        (Some(broker), Some(receiver))
    } else {
        (None, None)
    };

    let ledger = Arc::new(Ledger::new(
        storage,
        cache.clone(),
        idempotency,
        pending_locks,
        broker,
        config.cache_size,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer =
        receiver.map(|receiver| spawn_consumer(ledger.clone(), receiver, shutdown_rx.clone()));

    let server = rpc::build_server(ledger.clone(), &config.rpc_bind_address, metrics_handle)?;
    let handle = server.handle();
    // the server future must keep being polled while a stop is in progress
    let mut server_task = tokio::spawn(server);

    tokio::select! {
        result = &mut server_task => {
            result.context("RPC server task failed")?
                .context("RPC server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            handle.stop(true).await;
            let _ = server_task.await;
        }
    }

    // stop the consumer after the server so in-flight dispatches drain
    let _ = shutdown_tx.send(true);
    if let Some(consumer) = consumer {
        let _ = consumer.await;
    }
    ledger.shutdown().await?;
    info!("storage flushed, exiting");
    Ok(())
}
