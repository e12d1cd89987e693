//! Aggregate check-ins as the single reader of the log, resuming from the stored checkpoint.
use std::sync::Arc;

use envconfig::Envconfig;
use health::HealthRegistry;

use checkin_common::keys::KeySpace;
use checkin_common::metrics::serve;
use checkin_common::redis::RedisStore;
use checkin_common::retry::RetryPolicy;
use checkin_worker::config::Config;
use checkin_worker::processor::CheckpointProcessor;
use checkin_worker::service;

#[tokio::main]
async fn main() {
    service::init_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = RedisStore::new(&config.redis_url, KeySpace::new(&config.key_prefix))
        .await
        .expect("failed to connect to redis");

    let liveness = HealthRegistry::new("liveness");
    let deadline = time::Duration::try_from(config.liveness_deadline())
        .expect("liveness deadline out of range");

    let processor = CheckpointProcessor::new(
        Arc::new(store),
        liveness.register("processor", deadline),
    )
    .block_timeout(config.block_timeout.0)
    .simulated_work(config.simulated_work_max_ms.0)
    .retry_policy(RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    ));

    let router = service::router("checkin-processor", liveness, config.export_prometheus)
        .expect("failed to install metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = service::shutdown_token().expect("failed to register signal handlers");
    processor.run(shutdown).await;
}
