use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nerva_core::prelude::*;
use nerva_scheduler::{GlobalScheduler, LoadBased, SchedulerConfig};
use serde_json::Value;

async fn counting_subsystem(name: &str) -> (Arc<Subsystem>, Arc<AtomicUsize>) {
    let sub = Subsystem::builder(name).create();
    sub.build().await.unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    sub.register_route(
        "work",
        handler(move |_m, _p, _o| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
        RouteMetadata::default(),
    )
    .unwrap();
    (sub, counter)
}

async fn fill(sub: &Arc<Subsystem>, n: usize) {
    for _ in 0..n {
        let msg = sub
            .context()
            .factory()
            .create(
                &format!("{}://work", Subsystem::name(sub)),
                Value::Null,
                CreateOptions::default(),
            )
            .unwrap();
        sub.accept(msg, DispatchOptions::default()).await.unwrap();
    }
}

#[tokio::test]
async fn load_based_picks_the_deepest_queue_first() {
    let scheduler = GlobalScheduler::with_strategy(
        SchedulerConfig::default(),
        Box::<LoadBased>::default(),
    );
    let (small, small_count) = counting_subsystem("small").await;
    let (big, big_count) = counting_subsystem("big").await;
    fill(&small, 3).await;
    fill(&big, 7).await;
    scheduler.register(small.clone());
    scheduler.register(big.clone());

    // One pass with a generous slice drains the deeper queue.
    let processed = scheduler.run_once().await;
    assert_eq!(processed, 7);
    assert_eq!(big_count.load(Ordering::SeqCst), 7);
    assert_eq!(small_count.load(Ordering::SeqCst), 0);

    // Next pass moves on to the remaining queue.
    scheduler.run_once().await;
    assert_eq!(small_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn round_robin_is_fair_over_a_window() {
    let scheduler = GlobalScheduler::new(SchedulerConfig {
        tick: Duration::from_millis(1),
        slice: Duration::from_millis(50),
    });
    let mut counters = Vec::new();
    let mut subs = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let (sub, counter) = counting_subsystem(name).await;
        fill(&sub, 6).await;
        scheduler.register(sub.clone());
        counters.push(counter);
        subs.push(sub);
    }

    // Each pass drains at most what the slice allows; with fast handlers a
    // slice drains the whole queue, so three passes visit all three
    // subsystems exactly once each.
    for _ in 0..3 {
        scheduler.run_once().await;
    }
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }
}

#[tokio::test]
async fn paused_subsystems_are_skipped_until_resume() {
    let scheduler = GlobalScheduler::new(SchedulerConfig::default());
    let (sub, counter) = counting_subsystem("pausy").await;
    fill(&sub, 2).await;
    sub.pause().unwrap();
    scheduler.register(sub.clone());

    assert_eq!(scheduler.run_once().await, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    sub.resume().unwrap();
    assert_eq!(scheduler.run_once().await, 2);
}

#[tokio::test]
async fn started_loop_drains_work_and_stops_cooperatively() {
    let scheduler = Arc::new(GlobalScheduler::new(SchedulerConfig {
        tick: Duration::from_millis(1),
        slice: Duration::from_millis(10),
    }));
    let (sub, counter) = counting_subsystem("looped").await;
    fill(&sub, 10).await;
    scheduler.register(sub.clone());

    let handle = scheduler.start();
    assert!(scheduler.is_running());

    // Work arriving after start is picked up too.
    tokio::time::sleep(Duration::from_millis(50)).await;
    fill(&sub, 5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!scheduler.is_running());
    assert_eq!(counter.load(Ordering::SeqCst), 15);
    assert!(scheduler.stats().processed() >= 15);
}

#[tokio::test]
async fn unregister_removes_from_rotation() {
    let scheduler = GlobalScheduler::new(SchedulerConfig::default());
    let (sub, _counter) = counting_subsystem("temp").await;
    scheduler.register(sub.clone());
    assert_eq!(scheduler.len(), 1);
    assert!(scheduler.unregister("temp"));
    assert!(!scheduler.unregister("temp"));
    assert!(scheduler.is_empty());
}

#[tokio::test]
async fn register_replaces_same_name() {
    let scheduler = GlobalScheduler::new(SchedulerConfig::default());
    let (first, _) = counting_subsystem("dup").await;
    let (second, _) = counting_subsystem("dup").await;
    scheduler.register(first);
    scheduler.register(second);
    assert_eq!(scheduler.len(), 1);
}
