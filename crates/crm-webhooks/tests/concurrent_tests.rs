//! Overlapping retry runs must never deliver the same record twice.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use common::*;
use crm_webhooks::{
    DeliveryStatus, DeliveryStore, Dispatcher, InMemoryStore, ManualClock, RetryScheduler,
    Subscriber, WebhookEventType,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_runs_claim_each_record_once() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let executor = ScriptedExecutor::always_ok().with_delay(StdDuration::from_millis(50));

    let sub = Subscriber::new("https://hooks.example.com");
    store.upsert_subscriber(sub.clone()).await.unwrap();
    let mut ids = Vec::new();
    for _ in 0..40 {
        ids.push(seed_failed_delivery(store.as_ref(), &sub, 0, t0()).await.id);
    }

    let schedulers: Vec<_> = (0..4)
        .map(|_| {
            Arc::new(
                RetryScheduler::new(store.clone(), Arc::new(executor.clone()))
                    .with_clock(clock.clone())
                    .with_batch_size(15)
                    .with_concurrency(5),
            )
        })
        .collect();

    let mut handles = Vec::new();
    for scheduler in &schedulers {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move { scheduler.run_once().await }));
    }

    let mut claimed = 0;
    for handle in handles {
        claimed += handle.await.unwrap().claimed;
    }
    // Drain whatever the four overlapping runs could not fit.
    while schedulers[0].run_once().await.claimed > 0 {}

    let per_delivery = executor.attempts_per_delivery();
    assert_eq!(per_delivery.len(), 40);
    assert!(per_delivery.values().all(|&n| n == 1), "{per_delivery:?}");
    assert!(claimed <= 40);

    for id in ids {
        let rec = store.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(rec.status, DeliveryStatus::Success);
        assert_eq!(rec.retry_count, 1);
    }
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed_after_lease() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let executor = ScriptedExecutor::always_ok();
    let sub = Subscriber::new("https://hooks.example.com");
    store.upsert_subscriber(sub.clone()).await.unwrap();
    let rec = seed_failed_delivery(store.as_ref(), &sub, 1, t0()).await;

    // A worker claims the record and dies before finishing.
    let lease = Duration::seconds(300);
    let stolen = store.claim_due(t0(), 10, lease).await.unwrap();
    assert_eq!(stolen.len(), 1);

    let scheduler = RetryScheduler::new(store.clone(), Arc::new(executor.clone()))
        .with_clock(clock.clone())
        .with_claim_lease(lease);

    clock.advance(Duration::seconds(299));
    assert_eq!(scheduler.run_once().await.claimed, 0);
    assert_eq!(executor.call_count(), 0);

    clock.advance(Duration::seconds(1));
    let summary = scheduler.run_once().await;
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.succeeded, 1);

    let done = store.get_delivery(rec.id).await.unwrap().unwrap();
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.retry_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_fan_out_respects_concurrency_limit() {
    let store = Arc::new(InMemoryStore::new());
    let executor = ScriptedExecutor::always_ok().with_delay(StdDuration::from_millis(20));
    for i in 0..12 {
        let sub = Subscriber::new(format!("https://hooks{i}.example.com"))
            .with_events([WebhookEventType::DealWon]);
        store.upsert_subscriber(sub).await.unwrap();
    }

    let dispatcher =
        Dispatcher::new(store.clone(), Arc::new(executor.clone())).with_concurrency(3);
    let summary = dispatcher
        .dispatch(WebhookEventType::DealWon, &deal_payload("d1"))
        .await;

    assert_eq!(summary.matched, 12);
    assert_eq!(summary.delivered, 12);
    assert_eq!(executor.call_count(), 12);
    assert!(executor.max_in_flight() <= 3);
    assert_eq!(store.all_deliveries().await.len(), 12);
}

#[tokio::test]
async fn test_record_stuck_pending_is_retried_after_lease() {
    let store = Arc::new(FaultyStore::new().fail_complete_times(1));
    let clock = Arc::new(ManualClock::new(t0()));
    let executor = ScriptedExecutor::always_ok();
    let sub = Subscriber::new("https://hooks.example.com").with_events([WebhookEventType::DealWon]);
    store.upsert_subscriber(sub.clone()).await.unwrap();

    // The endpoint got the event, but the outcome was never written.
    let summary = Dispatcher::new(store.clone(), Arc::new(executor.clone()))
        .with_clock(clock.clone())
        .dispatch(WebhookEventType::DealWon, &deal_payload("d1"))
        .await;
    assert_eq!(summary.errored, 1);
    let stuck = store.list_deliveries(sub.id, 1).await.unwrap()[0].clone();
    assert_eq!(stuck.status, DeliveryStatus::Pending);

    let lease = Duration::seconds(300);
    let scheduler = RetryScheduler::new(store.clone(), Arc::new(executor.clone()))
        .with_clock(clock.clone())
        .with_claim_lease(lease);

    clock.advance(Duration::seconds(299));
    assert_eq!(scheduler.run_once().await.claimed, 0);

    clock.advance(Duration::seconds(1));
    let summary = scheduler.run_once().await;
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(executor.call_count(), 2);

    let done = store.get_delivery(stuck.id).await.unwrap().unwrap();
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.retry_count, 1);
    assert_eq!(executor.attempts_per_delivery()[&stuck.id], 2);
}
