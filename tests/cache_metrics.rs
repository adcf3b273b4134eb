use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use metrics_util::debugging::DebuggingRecorder;
use time::Duration;
use tokio::time::{sleep, timeout};

use dispensa::{
    Cache, CacheKey, CacheStore, MemcachedConfig, MemcachedStore, MemoryStore, WriteOptions,
    metrics,
};

fn key(name: &str) -> CacheKey {
    CacheKey::new(name)
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Hit and miss through the front-end.
    let cache = Cache::new(Arc::new(MemoryStore::new()));
    let k = key("metrics/item");
    cache.write(&k, &"value").await.unwrap();
    assert!(cache.read::<String>(&k).await.unwrap().is_some());
    assert!(
        cache
            .read::<String>(&key("metrics/absent"))
            .await
            .unwrap()
            .is_none()
    );

    // Foreground producer timing on a cold fetch.
    let _: String = cache
        .fetch(&key("metrics/built"), || async { Ok("built".to_owned()) })
        .await
        .unwrap();

    // Stale serving plus one background regeneration.
    let stale = key("metrics/stale");
    cache
        .write_with(
            &stale,
            &"old",
            &WriteOptions::expiring_in(Duration::seconds(-1)),
        )
        .await
        .unwrap();
    let options =
        WriteOptions::expiring_in(Duration::seconds(60)).with_race_ttl(Duration::seconds(300));
    let served: String = cache
        .fetch_with(&stale, &options, || async { Ok("new".to_owned()) })
        .await
        .unwrap();
    assert_eq!(served, "old");
    timeout(StdDuration::from_secs(5), async {
        while cache.read::<String>(&stale).await.unwrap().as_deref() != Some("new") {
            sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .expect("background regeneration should land");

    // Eviction and the usage gauge from a store too small for two entries.
    let tiny = Cache::new(Arc::new(MemoryStore::with_budget(256)));
    tiny.write(&key("evict/a"), &"x".repeat(64)).await.unwrap();
    tiny.write(&key("evict/b"), &"y".repeat(64)).await.unwrap();

    // Read errors degrade to misses; an unreachable memcached endpoint
    // produces one without any external service.
    let config = MemcachedConfig {
        endpoints: vec!["127.0.0.1:1".to_owned()],
        op_timeout: StdDuration::from_millis(200),
    };
    let unreachable = Cache::new(Arc::new(
        MemcachedStore::new(config).expect("construction is lazy"),
    ));
    assert!(
        unreachable
            .read::<String>(&key("metrics/nowhere"))
            .await
            .unwrap()
            .is_none()
    );

    // Lease reclaim after timeout, via the store trait.
    let store = MemoryStore::new();
    let leased = key("metrics/leased");
    assert!(
        store
            .try_acquire_lease(&leased, Duration::seconds(-1))
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store
            .try_acquire_lease(&leased, Duration::seconds(-1))
            .await
            .unwrap()
            .is_some()
    );

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        metrics::HIT_TOTAL,
        metrics::MISS_TOTAL,
        metrics::STALE_SERVED_TOTAL,
        metrics::REGENERATE_TOTAL,
        metrics::EVICT_TOTAL,
        metrics::READ_ERROR_TOTAL,
        metrics::LEASE_RECLAIMED_TOTAL,
        metrics::MEMORY_USED_BYTES,
        metrics::PRODUCER_MS,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
