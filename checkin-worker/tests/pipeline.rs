use std::sync::Arc;
use std::time::Duration;

use checkin_capture::gateway::Gateway;
use checkin_common::aggregate::{average_stars, CommitOutcome, LocationAggregate};
use checkin_common::checkin::{Checkin, LogEntry, LogEntryId};
use checkin_common::filter::DedupFilter;
use checkin_common::mock::MemoryStore;
use checkin_common::store::CheckinStore;
use checkin_worker::worker::{AggregationWorker, Outcome};
use health::HealthRegistry;
use serde_json::json;

const GROUP: &str = "checkinConsumers";

fn gateway(store: &MemoryStore) -> Gateway {
    let filter = DedupFilter::new(1_000_000, 0.0001).expect("valid filter settings");
    Gateway::new(Arc::new(store.clone()), filter, 10_000)
}

async fn worker(store: &MemoryStore, consumer: &str) -> AggregationWorker {
    store.ensure_group(GROUP).await.expect("group created");
    let liveness = HealthRegistry::new("liveness").register(consumer, time::Duration::seconds(30));

    AggregationWorker::new(consumer, GROUP, Arc::new(store.clone()), liveness)
        .block_timeout(Duration::from_millis(10))
}

/// Runs the worker until it finds nothing left to claim.
async fn drain(worker: &mut AggregationWorker) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    loop {
        match worker.run_once().await.expect("iteration succeeds") {
            Outcome::Waiting => return outcomes,
            outcome => outcomes.push(outcome),
        }
    }
}

#[tokio::test]
async fn submitted_checkins_reach_the_aggregates() {
    let store = MemoryStore::new();
    let gateway = gateway(&store);
    let mut worker = worker(&store, "worker-1").await;

    gateway
        .submit(&json!({"userId": 5, "locationId": 2, "starRating": 0}))
        .await
        .expect("first check-in accepted");
    gateway
        .submit(&json!({"userId": 5, "locationId": 2, "starRating": 4}))
        .await
        .expect("second check-in accepted");

    assert_eq!(drain(&mut worker).await.len(), 2);

    assert_eq!(
        store.location(2).await.unwrap(),
        LocationAggregate {
            num_checkins: 2,
            num_stars: 4,
            average_stars: 2
        }
    );
    let user = store.user(5).await.unwrap();
    assert_eq!(user.num_checkins, 2);
    assert_eq!(user.last_seen_at, Some(2));
}

#[tokio::test]
async fn redelivery_after_acknowledgment_changes_nothing() {
    let store = MemoryStore::new();
    let mut worker = worker(&store, "worker-1").await;
    let checkin = Checkin::from_parts(8, 3, 5).unwrap();
    store.append_with_id(LogEntryId::new(1000, 0), &checkin);

    drain(&mut worker).await;
    let before = store.location(3).await.unwrap();

    // The same entry delivered again, as after a lost acknowledgment.
    let entry = LogEntry {
        id: LogEntryId::new(1000, 0),
        checkin,
    };
    assert_eq!(
        store.commit_and_ack(GROUP, &entry).await.unwrap(),
        CommitOutcome::AlreadyProcessed
    );

    assert_eq!(store.location(3).await.unwrap(), before);
    assert_eq!(store.user(8).await.unwrap().num_checkins, 1);
}

#[tokio::test]
async fn reclaimed_older_checkin_does_not_move_recency_back() {
    let store = MemoryStore::new();
    let mut busy = worker(&store, "busy").await;
    store.append_with_id(LogEntryId::new(1000, 0), &Checkin::from_parts(4, 10, 3).unwrap());
    store.append_with_id(LogEntryId::new(2000, 0), &Checkin::from_parts(4, 11, 3).unwrap());

    // "stalled" claims the older entry and stops responding.
    let stalled = store
        .claim(GROUP, "stalled", Duration::ZERO, Duration::from_secs(60))
        .await
        .unwrap()
        .expect("an entry to claim");
    assert_eq!(stalled.id, "1000-0");

    // The newer entry is processed first, the older one once it is reclaimed.
    assert_eq!(drain(&mut busy).await.len(), 1);
    let mut rescuer = worker(&store, "rescuer")
        .await
        .claim_min_idle(Duration::ZERO);
    assert_eq!(drain(&mut rescuer).await.len(), 1);

    let user = store.user(4).await.unwrap();
    assert_eq!(user.num_checkins, 2);
    assert_eq!(user.last_checkin, Some(2000));
    assert_eq!(user.last_seen_at, Some(11));
}

#[tokio::test]
async fn competing_workers_agree_on_the_average() {
    let store = MemoryStore::new();
    let gateway = gateway(&store);
    let ratings: Vec<i64> = (0..60).map(|i| (i * 7) % 6).collect();

    for (user_id, rating) in ratings.iter().enumerate() {
        gateway
            .submit(&json!({"userId": user_id + 1, "locationId": 42, "starRating": rating}))
            .await
            .expect("check-in accepted");
    }

    let mut handles = Vec::new();
    for consumer in ["worker-1", "worker-2", "worker-3"] {
        let mut worker = worker(&store, consumer).await;
        handles.push(tokio::spawn(async move { drain(&mut worker).await.len() }));
    }

    let mut processed = 0;
    for handle in handles {
        processed += handle.await.expect("worker task");
    }
    assert_eq!(processed, ratings.len());

    let total: i64 = ratings.iter().sum();
    let location = store.location(42).await.unwrap();
    assert_eq!(location.num_checkins, ratings.len() as u64);
    assert_eq!(location.num_stars, total as u64);
    assert_eq!(
        location.average_stars,
        average_stars(total as u64, ratings.len() as u64)
    );
    assert_eq!(store.pending_count(GROUP), 0);
}
