//! Integration tests for engines and the operation scheduler, driven through
//! a `CoreContext` the way a host uses them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use statekeep::CoreContext;
use statekeep::checkpoint::{NoopHooks, StateMetadataSummary};
use statekeep::config::{CoreConfig, EngineConfig, SchedulerConfig};
use statekeep::engine::{EngineState, EngineWork};
use statekeep::navigation::UnitKindRegistry;
use statekeep::scheduler::OperationStatus;
use statekeep::store::MemoryObjectStore;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn context() -> CoreContext {
    let config = CoreConfig {
        engine: EngineConfig {
            active_delay: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
            recovery_delay: Duration::from_millis(20),
            ..EngineConfig::default()
        },
        scheduler: SchedulerConfig {
            max_workers: 4,
            max_concurrent_operations: 2,
            ..SchedulerConfig::default()
        },
        ..CoreConfig::default()
    };
    CoreContext::new(config, Arc::new(MemoryObjectStore::new()), UnitKindRegistry::new())
}

/// Counts ticks; fails the first `failures` of them.
#[derive(Default)]
struct Counter {
    ticks: AtomicUsize,
    failures: usize,
}

#[async_trait]
impl EngineWork for Counter {
    async fn tick(&self, _cancel: &CancellationToken) -> anyhow::Result<usize> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        if tick < self.failures {
            anyhow::bail!("tick {tick} failed");
        }
        Ok(1)
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn pending_operations_respect_concurrency_cap() {
    let ctx = context();
    ctx.start_scheduler();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ops: Vec<_> = (0..5)
        .map(|i| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            ctx.scheduler()
                .submit_pending(Some(format!("sender-{i}").into()), move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
        })
        .collect();

    for op in &ops {
        let status = timeout(TEST_TIMEOUT, op.finished()).await.unwrap();
        assert_eq!(status, OperationStatus::Completed);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn named_queues_are_serial_and_independent() {
    let ctx = context();
    ctx.start_scheduler();

    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());

    // The head of "slow" blocks until released.
    let blocked = {
        let gate = Arc::clone(&gate);
        ctx.scheduler().enqueue("slow", None, move || async move {
            gate.notified().await;
            Ok(())
        })
    };
    let behind = ctx.scheduler().enqueue("slow", None, || async { Ok(()) });

    let fast: Vec<_> = (1..=3)
        .map(|i| {
            let order = Arc::clone(&order);
            ctx.scheduler().enqueue("fast", None, move || async move {
                order.lock().unwrap().push(i);
                Ok(())
            })
        })
        .collect();

    for op in &fast {
        timeout(TEST_TIMEOUT, op.finished()).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(behind.status(), OperationStatus::Waiting);

    timeout(TEST_TIMEOUT, wait_until(|| blocked.status() == OperationStatus::Running))
        .await
        .unwrap();
    gate.notify_one();
    let status = timeout(TEST_TIMEOUT, behind.finished()).await.unwrap();
    assert_eq!(status, OperationStatus::Completed);

    ctx.shutdown().await;
}

#[tokio::test]
async fn immediate_submissions_dedup_by_sender() {
    let ctx = context();
    let gate = Arc::new(Notify::new());

    let first = {
        let gate = Arc::clone(&gate);
        ctx.scheduler()
            .submit_immediate(Some("refresh".into()), false, move || async move {
                gate.notified().await;
                Ok(())
            })
            .unwrap()
    };
    let duplicate = ctx
        .scheduler()
        .submit_immediate(Some("refresh".into()), false, || async { Ok(()) });
    assert!(duplicate.is_none());

    let forced = ctx
        .scheduler()
        .submit_immediate(Some("refresh".into()), true, || async { Ok(()) })
        .unwrap();
    timeout(TEST_TIMEOUT, forced.finished()).await.unwrap();

    timeout(TEST_TIMEOUT, wait_until(|| first.status() == OperationStatus::Running))
        .await
        .unwrap();
    gate.notify_one();
    let status = timeout(TEST_TIMEOUT, first.finished()).await.unwrap();
    assert_eq!(status, OperationStatus::Completed);

    ctx.shutdown().await;
}

#[tokio::test]
async fn freeze_parks_engine_until_released() {
    let ctx = context();
    let work = Arc::new(Counter::default());
    let engine = ctx.start_engine("counter", work.clone());

    timeout(TEST_TIMEOUT, wait_until(|| work.ticks.load(Ordering::SeqCst) > 0))
        .await
        .unwrap();

    assert!(engine.request_freeze().await);
    assert!(engine.is_frozen());
    let frozen_at = work.ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(work.ticks.load(Ordering::SeqCst), frozen_at);

    assert_eq!(engine.unfreeze(), 1);
    timeout(
        TEST_TIMEOUT,
        wait_until(|| work.ticks.load(Ordering::SeqCst) > frozen_at),
    )
    .await
    .unwrap();

    ctx.shutdown().await;
    assert_eq!(engine.status(), EngineState::Stopped);
    assert!(!engine.is_loop_alive());
}

#[tokio::test]
async fn failed_tick_is_reported_and_engine_recovers() {
    let ctx = context();
    let work = Arc::new(Counter {
        failures: 1,
        ..Counter::default()
    });
    let engine = Arc::new(statekeep::engine::ExecutionEngine::new(
        "flaky",
        ctx.config().engine.clone(),
        work.clone(),
    ));
    let mut failures = engine.subscribe_failures();
    assert!(engine.start(false));

    let failure = timeout(TEST_TIMEOUT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.engine_name, "flaky");
    assert_eq!(failure.prior_state, EngineState::Running);
    assert!(failure.error.contains("tick 0 failed"));

    timeout(TEST_TIMEOUT, wait_until(|| work.ticks.load(Ordering::SeqCst) > 1))
        .await
        .unwrap();
    assert!(engine.is_running());

    assert!(engine.shutdown().await);
}

#[tokio::test]
async fn clearing_state_releases_attached_engines() {
    let ctx = context();
    let work = Arc::new(Counter::default());
    let engine = ctx.start_engine("counter", work.clone());
    let checkpointer = ctx.checkpointer::<StateMetadataSummary, _>(NoopHooks);
    checkpointer.attach_engine(engine.clone());

    timeout(TEST_TIMEOUT, checkpointer.clear_state()).await.unwrap();
    assert!(!checkpointer.is_clearing_state());
    assert!(!engine.is_frozen());

    let after = work.ticks.load(Ordering::SeqCst);
    timeout(
        TEST_TIMEOUT,
        wait_until(|| work.ticks.load(Ordering::SeqCst) > after),
    )
    .await
    .unwrap();

    ctx.shutdown().await;
}
