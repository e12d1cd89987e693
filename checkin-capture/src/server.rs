use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use checkin_common::filter::{DedupFilter, FilterError};
use checkin_common::keys::KeySpace;
use checkin_common::redis::RedisStore;
use checkin_common::store::{CheckinStore, StoreError};
use health::{ComponentStatus, HealthHandle, HealthRegistry};
use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::router;

const STORE_PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid dedup filter settings: {0}")]
    Filter(#[from] FilterError),
    #[error("failed to connect to the store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to install the metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn ping_store(store: Arc<dyn CheckinStore>, health: HealthHandle) {
    let mut interval = tokio::time::interval(STORE_PING_INTERVAL);
    loop {
        interval.tick().await;
        match store.ping().await {
            Ok(()) => health.report_healthy(),
            Err(err) => {
                warn!("store ping failed: {}", err);
                health.report_status(ComponentStatus::Unhealthy);
            }
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let filter = DedupFilter::new(config.filter_capacity, config.filter_error_rate)?;
    let store: Arc<dyn CheckinStore> =
        Arc::new(RedisStore::new(&config.redis_url, KeySpace::new(&config.key_prefix)).await?);

    let readiness = HealthRegistry::new("readiness");
    let store_health = readiness.register("store", time::Duration::seconds(15));
    tokio::spawn(ping_store(store.clone(), store_health));

    let gateway = Arc::new(Gateway::new(store, filter, config.max_log_length));
    let app = router::router(gateway, readiness, config.export_prometheus)?;

    info!(
        "listening on {:?}, dedup filter of {} bits and {} hashes",
        listener.local_addr()?,
        filter.bits(),
        filter.hashes()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
