// Descriptor cache behaviour under concurrent misses.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{generate_content, Fixture, HOME_SHARD};
use filestream_gateway::engine::cache::DescriptorCache;
use filestream_gateway::handle::FileHandle;
use filestream_gateway::GatewayError;

#[tokio::test]
async fn test_concurrent_misses_resolve_once() {
    let fx = Fixture::new();
    let handle = fx.publish(1, HOME_SHARD, generate_content(4096), "video", "a.mp4");
    fx.store.set_lookup_delay(Duration::from_millis(50));
    let cache = Arc::new(DescriptorCache::new(fx.store.clone()));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { cache.get(&handle).await.unwrap() }));
    }
    let mut descriptors = Vec::new();
    for t in tasks {
        descriptors.push(t.await.unwrap());
    }

    assert_eq!(fx.store.lookup_count(), 1);
    assert_eq!(cache.decode_count(), 1);
    assert!(descriptors.iter().all(|d| Arc::ptr_eq(d, &descriptors[0])));
    assert_eq!(descriptors[0].size_bytes, 4096);
}

#[tokio::test]
async fn test_two_requests_for_unseen_handle_decode_once() {
    let fx = Fixture::new();
    let handle = fx.publish(2, HOME_SHARD, generate_content(4096), "video", "a.mp4");
    fx.store.set_lookup_delay(Duration::from_millis(20));

    let cache = fx.gateway.cache();
    let (a, b) = tokio::join!(cache.get(&handle), cache.get(&handle));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(fx.store.lookup_count(), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let fx = Fixture::new();
    let handle = fx.signer.derive(3);
    let cache = DescriptorCache::new(fx.store.clone());

    assert!(matches!(cache.get(&handle).await, Err(GatewayError::NotFound)));
    assert!(cache.is_empty());

    // Published after the miss: the next lookup must see it.
    let published = fx.publish(3, HOME_SHARD, generate_content(10), "audio", "a.mp3");
    assert_eq!(published, handle);
    assert!(cache.get(&handle).await.is_ok());
    assert_eq!(fx.store.lookup_count(), 2);
}

#[tokio::test]
async fn test_revoked_handle_survives_until_flush() {
    let fx = Fixture::new();
    let handle = fx.publish(4, HOME_SHARD, generate_content(10), "audio", "a.mp3");
    let cache = DescriptorCache::new(fx.store.clone());

    cache.get(&handle).await.unwrap();
    fx.store.revoke(handle.as_str());
    assert!(cache.get(&handle).await.is_ok());

    cache.flush();
    assert!(matches!(cache.get(&handle).await, Err(GatewayError::NotFound)));
}

#[tokio::test]
async fn test_unknown_handle() {
    let fx = Fixture::new();
    let cache = DescriptorCache::new(fx.store.clone());
    let handle = FileHandle::parse("000000000000000000000000").unwrap();
    assert!(matches!(cache.get(&handle).await, Err(GatewayError::NotFound)));
}
