#![cfg(feature = "redis")]
//! Runs against a live Redis when `CATS_TEST_REDIS_URL` is set, e.g. `redis://127.0.0.1:6379/15`.

use std::collections::BTreeSet;
use std::env;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use cats_cache::builder::CacheResultBuilder;
use cats_cache::kv::KeyValueCache;
use cats_cache::kv::KeyValueCacheOptions;
use cats_cache::prelude::*;
use cats_cache::store::redis::RedisStore;
use cats_cache::store::StoreReader;
use serde_json::json;

async fn redis_cache(compression: bool) -> Option<KeyValueCache<RedisStore>> {
    let Ok(url) = env::var("CATS_TEST_REDIS_URL")
    else {
        eprintln!("CATS_TEST_REDIS_URL is not set, skipping");
        return None;
    };

    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let options = KeyValueCacheOptions::builder()
        .prefix(format!("cats-test-{nanos}"))
        .compression(compression)
        .max_merge_batch_size(10)
        .scan_size(7)
        .build()
        .unwrap();
    let store = RedisStore::connect(&url, true).await.unwrap();
    Some(KeyValueCache::new(store, options))
}

fn instance(name: &str) -> String {
    Keys::resource("aws", "instances", "acct", "us-east-1", name)
}

#[tokio::test]
async fn merge_read_and_evict() {
    let Some(backend) = redis_cache(false).await
    else {
        return;
    };
    let members_key = backend.members_key("instances");
    let cache = DefaultProviderCache::new(std::sync::Arc::new(backend), KeyParsers::new());
    let source = CacheSource::new("acct/instances", MergeScope::account("aws", "acct", None));
    let authoritative = BTreeSet::from(["instances".to_string()]);

    let mut builder = CacheResultBuilder::new();
    for n in 0..25 {
        builder
            .namespace("instances")
            .keep(&instance(&format!("i-{n}")))
            .set_attribute("n", n)
            .add_relationship("securityGroups", "aws:securityGroups:acct:us-east-1:web");
    }
    cache.put_cache_result(&source, &authoritative, builder.build()).await.unwrap();

    let all = cache.get_all("instances", None, None).await.unwrap();
    assert_eq!(all.len(), 25);
    let matched = cache.filter_identifiers("instances", "*:i-2?").await.unwrap();
    assert_eq!(matched.len(), 5);

    let stats = cache
        .put_cache_result(&source, &authoritative, CacheResult::empty())
        .await
        .unwrap();
    assert_eq!(stats.evicted_items(), 25);
    assert!(cache
        .backend()
        .store()
        .scan_set(&members_key, None, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn compressed_attributes_round_trip() {
    let Some(cache) = redis_cache(true).await
    else {
        return;
    };
    let mut attributes = Attributes::new();
    attributes.insert("description".into(), json!("x".repeat(512)));
    cache
        .merge("images", CacheData::new("ami-1", attributes.clone(), Relationships::new()))
        .await
        .unwrap();

    let stored = cache.get("images", "ami-1", None).await.unwrap().unwrap();
    assert_eq!(stored.attributes(), &attributes);
    cache.evict("images", "ami-1").await.unwrap();
    assert!(!cache.exists("images", "ami-1").await.unwrap());
}
