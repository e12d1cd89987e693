//! Administrative operations on the pipeline's store.
use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use tracing::info;

use checkin_common::filter::DedupFilter;
use checkin_common::keys::KeySpace;
use checkin_common::redis::RedisStore;
use checkin_common::store::CheckinStore;
use checkin_worker::config::Config;
use checkin_worker::service;

#[derive(Parser)]
#[command(about = "Administrative operations on the check-in store")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Forget every check-in the dedup filter has seen
    RebuildFilter,
    /// Drop the consumer group, with its pending entries, and recreate it at the start of the log
    ResetGroup,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    service::init_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let store = RedisStore::new(&config.redis_url, KeySpace::new(&config.key_prefix))
        .await
        .expect("failed to connect to redis");

    match args.command {
        Command::RebuildFilter => {
            let filter = DedupFilter::new(config.filter_capacity, config.filter_error_rate)
                .expect("invalid dedup filter settings");
            store
                .rebuild_filter()
                .await
                .expect("failed to rebuild the dedup filter");
            info!(
                "dedup filter {} cleared, sized for {} bits and {} hashes",
                store.keys().checkin_filter(),
                filter.bits(),
                filter.hashes()
            );
        }
        Command::ResetGroup => {
            let group = config.consumer_group.as_str();
            store
                .reset_group(group)
                .await
                .expect("failed to reset the consumer group");
            info!("consumer group {group} reset to the start of {}", store.keys().checkins());
        }
    }
}
