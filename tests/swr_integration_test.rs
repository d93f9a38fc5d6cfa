//! End-to-end tests for the stale-while-revalidate engine: dedupe,
//! freshness windows, background revalidation, throttling, debouncing,
//! and the priority queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fetchlayer::cache::{CacheManager, CacheManagerConfig, MemoryCacheConfig, SwrOverrides};
use fetchlayer::clock::{Clock, ManualClock};
use fetchlayer::error::FetchError;
use fetchlayer::events::EventKind;

fn manager_with_clock(
    drain_interval: Duration,
) -> (Arc<CacheManager<String>>, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(1_000));
    let config = CacheManagerConfig {
        memory: MemoryCacheConfig { max_entries: 0, ..MemoryCacheConfig::default() },
        drain_interval,
        ..CacheManagerConfig::default()
    };
    let manager = CacheManager::new(config, clock.clone() as Arc<dyn Clock>);
    (manager, clock)
}

fn counting_fetch(
    value: &str,
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<String, FetchError>> + Send>,
> + Send
       + Sync
       + 'static {
    let value = value.to_string();
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    }
}

#[tokio::test]
async fn test_parallel_swr_misses_invoke_fetch_once() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let slow_fetch = {
        let calls = Arc::clone(&calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok("R".to_string())
            }
        }
    };

    let a = {
        let manager = Arc::clone(&manager);
        let fetch = slow_fetch.clone();
        tokio::spawn(async move { manager.swr("K", fetch, &SwrOverrides::default()).await })
    };
    let b = {
        let manager = Arc::clone(&manager);
        let fetch = slow_fetch.clone();
        tokio::spawn(async move { manager.swr("K", fetch, &SwrOverrides::default()).await })
    };

    assert_eq!(a.await.unwrap().unwrap(), "R");
    assert_eq!(b.await.unwrap().unwrap(), "R");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fresh_entry_served_without_fetch() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    manager.set(
        "K",
        "cached".to_string(),
        &SwrOverrides {
            stale_time: Some(Duration::from_secs(60)),
            cache_time: Some(Duration::from_secs(120)),
            ..SwrOverrides::default()
        },
    );

    let got = manager
        .swr("K", counting_fetch("fetched", &calls), &SwrOverrides::default())
        .await
        .unwrap();

    assert_eq!(got, "cached");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_swr_stale_path_serves_then_revalidates() {
    let (manager, clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_millis(5_000)),
        cache_time: Some(Duration::from_millis(60_000)),
        ..SwrOverrides::default()
    };
    manager.set("K", "v1".to_string(), &overrides);

    clock.advance(10_000); // past stale_at, inside expires_at

    let served = manager
        .swr("K", counting_fetch("v2", &calls), &overrides)
        .await
        .unwrap();
    assert_eq!(served, "v1"); // stale data immediately

    // Let the background revalidation land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let refreshed = manager
        .swr("K", counting_fetch("v3", &calls), &overrides)
        .await
        .unwrap();
    assert_eq!(refreshed, "v2");
    assert_eq!(calls.load(Ordering::SeqCst), 1); // fresh again, no new fetch

    let entry = manager.entry("K").expect("entry present");
    assert_eq!(entry.revalidation_count, 1);
    assert!(entry.last_revalidated_at.is_some());
    assert!(!entry.is_revalidating);
}

#[tokio::test]
async fn test_revalidate_false_serves_stale_without_fetch() {
    let (manager, clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_millis(100)),
        cache_time: Some(Duration::from_millis(60_000)),
        revalidate: Some(false),
        ..SwrOverrides::default()
    };
    manager.set("K", "v1".to_string(), &overrides);
    clock.advance(500);

    let served = manager
        .swr("K", counting_fetch("v2", &calls), &overrides)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(served, "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_condition_unmet_without_fallback() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        should_fetch: Some(Arc::new(|| false)),
        ..SwrOverrides::default()
    };

    let result = manager
        .swr("K", counting_fetch("v", &calls), &overrides)
        .await;

    assert!(matches!(result, Err(FetchError::ConditionUnmet(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validator_rejects_fetched_data() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        validator: Some(Arc::new(|data: &String| data != "bad")),
        ..SwrOverrides::default()
    };

    let result = manager
        .swr("K", counting_fetch("bad", &calls), &overrides)
        .await;

    assert!(matches!(result, Err(FetchError::Validation(_))));
    assert!(manager.entry("K").is_none());
}

#[tokio::test]
async fn test_validator_rejects_cached_entry_and_refetches() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    manager.set(
        "K",
        "stale-garbage".to_string(),
        &SwrOverrides {
            stale_time: Some(Duration::from_secs(60)),
            ..SwrOverrides::default()
        },
    );

    let overrides = SwrOverrides {
        validator: Some(Arc::new(|data: &String| data != "stale-garbage")),
        ..SwrOverrides::default()
    };

    let got = manager
        .swr("K", counting_fetch("clean", &calls), &overrides)
        .await
        .unwrap();

    assert_eq!(got, "clean");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_foreground_timeout() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));

    let overrides = SwrOverrides {
        timeout: Some(Duration::from_millis(20)),
        ..SwrOverrides::default()
    };

    let result = manager
        .swr(
            "K",
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            },
            &overrides,
        )
        .await;

    assert!(matches!(result, Err(FetchError::Timeout(_))));
}

#[tokio::test]
async fn test_revalidation_failure_keeps_stale_data() {
    let (manager, clock) = manager_with_clock(Duration::from_millis(50));

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_millis(100)),
        cache_time: Some(Duration::from_millis(60_000)),
        max_retries: Some(0),
        ..SwrOverrides::default()
    };
    manager.set("K", "v1".to_string(), &overrides);
    clock.advance(500);

    let error_events = Arc::new(AtomicUsize::new(0));
    let error_events_clone = Arc::clone(&error_events);
    manager.events().on(EventKind::RevalidateError, move |_| {
        error_events_clone.fetch_add(1, Ordering::SeqCst);
    });

    let served = manager
        .swr(
            "K",
            || async { Err::<String, _>(FetchError::Network("down".into())) },
            &overrides,
        )
        .await
        .unwrap();
    assert_eq!(served, "v1");

    tokio::time::sleep(Duration::from_millis(60)).await;

    // Stale data survives the failed refresh.
    let entry = manager.entry("K").expect("entry still present");
    assert_eq!(entry.data, "v1");
    assert!(!entry.is_revalidating);
    assert!(entry.last_error.is_some());
    assert_eq!(error_events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_throttle_collapses_rapid_revalidations() {
    let (manager, clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_millis(10)),
        cache_time: Some(Duration::from_millis(60_000)),
        throttle_time: Some(Duration::from_millis(1_000)),
        ..SwrOverrides::default()
    };
    manager.set("K", "v1".to_string(), &overrides);
    clock.advance(100); // stale

    let throttled = Arc::new(AtomicUsize::new(0));
    let throttled_clone = Arc::clone(&throttled);
    manager.events().on(EventKind::RevalidateThrottled, move |_| {
        throttled_clone.fetch_add(1, Ordering::SeqCst);
    });

    // First stale read revalidates.
    manager
        .swr("K", counting_fetch("v2", &calls), &overrides)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Entry is fresh again after revalidation; force it stale without
    // moving past the throttle window.
    clock.advance(100);

    manager
        .swr("K", counting_fetch("v3", &calls), &overrides)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(throttled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_priority_queue_serves_high_before_low() {
    // Slow drainer so both items are queued before the first drain.
    let (manager, clock) = manager_with_clock(Duration::from_millis(300));
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let overrides_for = |priority: u32| SwrOverrides::<String> {
        stale_time: Some(Duration::from_millis(10)),
        cache_time: Some(Duration::from_millis(60_000)),
        priority: Some(priority),
        ..SwrOverrides::default()
    };

    manager.set("lo", "lo-v1".to_string(), &overrides_for(1));
    manager.set("hi", "hi-v1".to_string(), &overrides_for(10));
    clock.advance(100); // both stale

    let lo_fetch = {
        let order = Arc::clone(&order);
        move || {
            order.lock().push("lo");
            async { Ok("lo-v2".to_string()) }
        }
    };
    let hi_fetch = {
        let order = Arc::clone(&order);
        move || {
            order.lock().push("hi");
            async { Ok("hi-v2".to_string()) }
        }
    };

    // Enqueue low first, high second.
    manager.swr("lo", lo_fetch, &overrides_for(1)).await.unwrap();
    manager.swr("hi", hi_fetch, &overrides_for(10)).await.unwrap();
    assert_eq!(manager.queued_revalidations(), 2);

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(*order.lock(), vec!["hi", "lo"]);
    assert_eq!(manager.queued_revalidations(), 0);
}

#[tokio::test]
async fn test_debounce_coalesces_bursts() {
    let (manager, clock) = manager_with_clock(Duration::from_millis(30));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_millis(10)),
        cache_time: Some(Duration::from_millis(60_000)),
        debounce_time: Some(Duration::from_millis(50)),
        ..SwrOverrides::default()
    };
    manager.set("K", "v1".to_string(), &overrides);
    clock.advance(100);

    let debounced = Arc::new(AtomicUsize::new(0));
    let debounced_clone = Arc::clone(&debounced);
    manager.events().on(EventKind::RevalidateDebounced, move |_| {
        debounced_clone.fetch_add(1, Ordering::SeqCst);
    });

    // A burst of stale reads inside the debounce window.
    for _ in 0..3 {
        manager
            .swr("K", counting_fetch("v2", &calls), &overrides)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(debounced.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_signal_aborts_foreground_fetch() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));

    let cancel: fetchlayer::cache::CancelSignal = Arc::new(tokio::sync::Notify::new());
    let overrides = SwrOverrides {
        cancel: Some(Arc::clone(&cancel)),
        ..SwrOverrides::default()
    };

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .swr(
                    "K",
                    || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok("never".to_string())
                    },
                    &overrides,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.notify_waiters();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert!(manager.entry("K").is_none());
}

#[tokio::test]
async fn test_custom_cache_key_bypasses_derivation() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));

    let overrides = SwrOverrides {
        cache_key: Some("custom".to_string()),
        stale_time: Some(Duration::from_secs(60)),
        ..SwrOverrides::default()
    };

    manager
        .swr("GET:/users::", counting_fetch("v", &calls), &overrides)
        .await
        .unwrap();

    assert!(manager.entry("custom").is_some());
    assert!(manager.entry("GET:/users::").is_none());
}

#[tokio::test]
async fn test_swr_events_fire_in_order() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(50));
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for (kind, label) in [
        (EventKind::CacheMiss, "miss"),
        (EventKind::RequestStart, "start"),
        (EventKind::CacheSet, "set"),
        (EventKind::RequestSuccess, "success"),
        (EventKind::RequestComplete, "complete"),
    ] {
        let seen = Arc::clone(&seen);
        manager.events().on(kind, move |_| seen.lock().push(label));
    }

    manager
        .swr("K", || async { Ok("v".to_string()) }, &SwrOverrides::default())
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec!["miss", "start", "set", "success", "complete"]);
}

#[tokio::test]
async fn test_cache_warming_registers_and_refreshes() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(30));
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch: fetchlayer::FetchFn<String> = {
        let calls = Arc::clone(&calls);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("warm".to_string()) })
        })
    };

    let overrides = SwrOverrides {
        stale_time: Some(Duration::from_secs(60)),
        warming_interval: Some(Duration::from_millis(150)),
        ..SwrOverrides::default()
    };

    manager.register_cache_warming("K", fetch, &overrides);
    tokio::time::sleep(Duration::from_millis(40)).await;

    // The registration-time warm populated the entry.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.entry("K").unwrap().data, "warm");
    assert_eq!(manager.warmed_keys(), vec!["K".to_string()]);

    assert!(manager.unregister_cache_warming("K"));
    let after = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn test_clear_discards_warming_and_entries() {
    let (manager, _clock) = manager_with_clock(Duration::from_millis(30));

    let fetch: fetchlayer::FetchFn<String> =
        Arc::new(|| Box::pin(async { Ok("warm".to_string()) }));
    manager.register_cache_warming("K", fetch, &SwrOverrides::default());
    manager.set("other", "v".to_string(), &SwrOverrides::default());

    manager.clear().await;

    assert!(manager.warmed_keys().is_empty());
    assert!(manager.keys().is_empty());
    manager.dispose();
}
