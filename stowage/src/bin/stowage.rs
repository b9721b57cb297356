//! The stowage daemon binary: wires the receiver, the flush scheduler, the
//! worker pool and the configured store together and runs until interrupted.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use stowage::{
    config::{Config, StoreConfig},
    handler::HandlerSet,
    receiver::{self, Receiver},
    signals,
};
use stowage_pool::WorkerPool;
use stowage_store::{MemoryStore, RedisStore, Store};
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] stowage::config::Error),
    #[error("Receiver error: {0}")]
    Receiver(#[from] receiver::Error),
    #[error("Storage error: {0}")]
    Store(#[from] stowage_store::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(version, about = "statsd-style metrics aggregation daemon")]
struct Opts {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "/etc/stowage/stowage.yaml")]
    config_path: PathBuf,
}

/// Tick at the flush interval, driving every handler with one wall-clock
/// stamp per tick.
async fn flush_schedule(handlers: Arc<HandlerSet>, interval: i64, shutdown: signals::Watcher) {
    let period = Duration::from_secs(u64::try_from(interval).expect("interval is positive"));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // An interval's first tick completes immediately; consume it so the
    // first flush lands a full period after startup.
    ticker.tick().await;

    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handlers.flush();
                for stats in handlers.statistics() {
                    debug!(
                        kind = stats.kind,
                        received = stats.received,
                        rejected = stats.rejected,
                        queue_depth = stats.queue_depth,
                        tracked_targets = stats.tracked_targets,
                        "handler statistics"
                    );
                }
            }
            () = &mut shutdown_wait => {
                info!("shutdown signal received");
                return;
            }
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let store: Arc<dyn Store> = match &config.store {
        StoreConfig::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::Redis(redis) => {
            info!(url = %redis.url, "connecting to redis store");
            Arc::new(RedisStore::connect(redis).await?)
        }
    };
    let pool = Arc::new(WorkerPool::new_with_config(config.pool));
    let handlers = Arc::new(HandlerSet::new(
        store,
        Arc::clone(&pool),
        config.retentions.clone(),
    ));

    let (broadcaster, shutdown) = signals::pair();
    let receiver = Receiver::new(config.listen, Arc::clone(&handlers), shutdown.clone());
    let mut receiver_task = tokio::spawn(receiver.run());
    let scheduler_task = tokio::spawn(flush_schedule(
        Arc::clone(&handlers),
        config.retentions.interval(),
        shutdown,
    ));

    // Run until interrupted, or until the receiver dies on its own -- a bind
    // failure at startup, for instance.
    let receiver_outcome = tokio::select! {
        interrupt = signal::ctrl_c() => {
            interrupt?;
            info!("interrupt received, shutting down");
            None
        }
        result = &mut receiver_task => Some(result),
    };

    broadcaster.signal();

    // One final flush so the current window is not lost, then let dispatched
    // work land before exit.
    handlers.flush();
    pool.until_idle().await;

    if let Err(err) = scheduler_task.await {
        error!(%err, "scheduler task failed");
    }
    let receiver_outcome = match receiver_outcome {
        Some(outcome) => outcome,
        None => receiver_task.await,
    };
    match receiver_outcome {
        Ok(outcome) => outcome?,
        Err(err) => error!(%err, "receiver task failed"),
    }

    info!("shutdown complete");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = Config::from_path(&opts.config_path)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(run(config))
}
