//! Join the consumer group and aggregate check-ins as one named consumer.
use std::sync::Arc;

use clap::Parser;
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing::Instrument;

use checkin_common::keys::KeySpace;
use checkin_common::metrics::serve;
use checkin_common::redis::RedisStore;
use checkin_common::retry::RetryPolicy;
use checkin_worker::config::Config;
use checkin_worker::error::WorkerError;
use checkin_worker::service;
use checkin_worker::worker::AggregationWorker;

#[derive(Parser)]
#[command(about = "Aggregates check-ins from the log as one consumer of a group")]
struct Args {
    /// Name of this consumer within the group, unique among running workers
    consumer_name: String,
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let args = Args::parse();
    service::init_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = RedisStore::new(&config.redis_url, KeySpace::new(&config.key_prefix))
        .await
        .expect("failed to connect to redis");

    let liveness = HealthRegistry::new("liveness");
    let deadline = time::Duration::try_from(config.liveness_deadline())
        .expect("liveness deadline out of range");
    let worker_liveness = liveness.register("worker", deadline);

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

    let worker = AggregationWorker::new(
        &args.consumer_name,
        config.consumer_group.as_str(),
        Arc::new(store),
        worker_liveness,
    )
    .block_timeout(config.block_timeout.0)
    .claim_min_idle(config.claim_min_idle.0)
    .simulated_work(config.simulated_work_max_ms.0)
    .retry_policy(retry_policy);

    let router = service::router("checkin-worker", liveness, config.export_prometheus)
        .expect("failed to install metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = service::shutdown_token().expect("failed to register signal handlers");
    let span = tracing::info_span!("worker", consumer = %args.consumer_name);
    worker.run(shutdown).instrument(span).await?;

    Ok(())
}
