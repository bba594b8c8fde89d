//! Integration tests for the autoscaling pools
//!
//! These tests validate:
//! - Reactive scale-up under blocking load, bounded by `max`
//! - Control-loop scale-down back to `min` after the idle window
//! - Unit count staying inside `[min, max]` during bursts

use prometheus_task_pool::core::PoolEvent;
use prometheus_task_pool::{
    AutoScaleConfig, AutoScalingPool, AutoScalingReusablePool, PoolError, SubmitOptions, WorkRegistry,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn registry() -> WorkRegistry {
    WorkRegistry::new()
        .register_typed("sleep_ms", |ms: u64, ctx| {
            ctx.sleep(Duration::from_millis(ms));
            Ok(ms)
        })
        .register("crash", |_, _| panic!("autoscaled unit crashed"))
}

fn config(min: usize, max: usize) -> AutoScaleConfig {
    AutoScaleConfig::new()
        .with_bounds(min, max)
        .with_idle_timeout_ms(50)
        .with_check_interval_ms(20)
        .with_name("autoscale-test")
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_scales_up_under_load_and_back_down() {
    println!("\n=== test_scales_up_under_load_and_back_down ===");
    let pool = AutoScalingPool::new(&config(1, 3), registry()).unwrap();
    let mut events = pool.subscribe();
    assert_eq!(pool.stats().total_workers, 1);

    let started = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| pool.submit("sleep_ms", json!(200), SubmitOptions::default()))
        .collect();
    assert!(wait_until(|| pool.stats().total_workers == 3, Duration::from_millis(150)).await);
    println!("Reached 3 units after {:?}", started.elapsed());

    for handle in handles {
        assert_eq!(handle.await, Ok(json!(200)));
    }
    let finished = Instant::now();
    assert!(wait_until(|| pool.stats().total_workers == 1, Duration::from_millis(300)).await);
    println!("Back to 1 unit after {:?}", finished.elapsed());

    let mut ups = 0;
    let mut downs = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::ScalingUp { to, .. } => {
                assert!(to <= 3);
                ups += 1;
            }
            PoolEvent::ScalingDown { .. } => downs += 1,
            _ => {}
        }
    }
    assert_eq!((ups, downs), (2, 2));
    pool.shutdown().await;
    println!("=== test_scales_up_under_load_and_back_down PASSED ===\n");
}

#[tokio::test]
async fn test_burst_stays_within_bounds() {
    let pool = AutoScalingPool::new(&config(2, 4), registry()).unwrap();
    let handles: Vec<_> = (0..20)
        .map(|i| pool.submit("sleep_ms", json!(5 + i % 3), SubmitOptions::default()))
        .collect();

    let mut observed = Vec::new();
    for _ in 0..40 {
        observed.push(pool.stats().total_workers);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }
    observed.push(pool.stats().total_workers);
    assert!(observed.iter().all(|n| (2..=4).contains(n)), "sizes: {observed:?}");
    assert!(wait_until(|| pool.stats().total_workers == 2, Duration::from_secs(2)).await);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_crash_below_floor_is_replaced() {
    let pool = AutoScalingPool::new(&config(1, 2), registry()).unwrap();
    let result = pool.submit("crash", Value::Null, SubmitOptions::default()).await;
    assert!(matches!(result, Err(PoolError::UnitCrashed { .. })));
    assert!(wait_until(|| pool.stats().idle_workers == 1, Duration::from_secs(2)).await);
    assert_eq!(pool.submit("sleep_ms", json!(1), SubmitOptions::default()).await, Ok(json!(1)));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_reusable_flavor_scales_both_ways() {
    let pool = AutoScalingReusablePool::new(&config(1, 3), registry()).unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| pool.run("sleep_ms", json!(150), SubmitOptions::default()))
        .collect();
    assert!(wait_until(|| pool.stats().total_threads == 3, Duration::from_millis(500)).await);

    for handle in handles {
        assert_eq!(handle.await, Ok(json!(150)));
    }
    assert!(wait_until(|| pool.stats().total_threads == 1, Duration::from_secs(2)).await);
    pool.shutdown().await;
    let stats = pool.stats();
    assert_eq!((stats.total_threads, stats.pending_tasks), (0, 0));
}

#[tokio::test]
async fn test_shutdown_stops_scaling() {
    let pool = AutoScalingPool::new(&config(1, 3), registry()).unwrap();
    let pending = pool.submit("sleep_ms", json!(5000), SubmitOptions::default());
    pool.shutdown().await;
    assert_eq!(pending.await, Err(PoolError::Shutdown));
    assert_eq!(
        pool.submit("sleep_ms", json!(1), SubmitOptions::default()).await,
        Err(PoolError::Shutdown)
    );
    assert_eq!(pool.stats().total_workers, 0);
}
