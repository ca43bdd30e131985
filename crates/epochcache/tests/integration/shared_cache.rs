use std::fs;
use std::time::Duration;

use epochcache::caching::{ManualClock, MemoizeOptions};
use epochcache::wrap;
use serde_json::json;

use crate::{
    BlobServer, Invocations, NOW, fs_shared_cache, http_shared_cache, persist_key,
    persisted_config, setup, tempdir, wait_for, wait_init,
};

#[tokio::test]
async fn test_fs_remote_value_wins() {
    setup();

    let cache_dir = tempdir();
    let shared_cache = fs_shared_cache(cache_dir.path());
    wait_init(&shared_cache).await;

    let config = persisted_config("balances");
    let key = persist_key(&config, &("0xabc", 1));
    let path = cache_dir.path().join(format!("{key}.json"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"42").unwrap();

    let producer = |(_address, _chain): (&'static str, u32)| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<u64, anyhow::Error>(7)
    };
    let options = MemoizeOptions::new("balances", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let balances = wrap(producer, options);

    let balance = tokio::time::timeout(Duration::from_secs(5), balances.call(("0xabc", 1)))
        .await
        .expect("the remote value should win the race");
    assert_eq!(balance.unwrap(), 42);

    // The value is now cached in memory as well.
    let balance = tokio::time::timeout(Duration::from_millis(100), balances.call(("0xabc", 1)))
        .await
        .unwrap();
    assert_eq!(balance.unwrap(), 42);
}

#[tokio::test]
async fn test_fs_write_through() {
    setup();

    let cache_dir = tempdir();
    let shared_cache = fs_shared_cache(cache_dir.path());
    wait_init(&shared_cache).await;

    let config = persisted_config("pools");
    let key = persist_key(&config, &"uniswap");
    let path = cache_dir.path().join(format!("{key}.json"));

    let producer = |_: &'static str| async {
        Ok::<_, anyhow::Error>(vec!["eth/usdc".to_owned(), "eth/dai".to_owned()])
    };
    let options = MemoizeOptions::new("pools", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let pools = wrap(producer, options);

    let value = pools.call("uniswap").await.unwrap();
    assert_eq!(value.len(), 2);

    wait_for(|| path.exists()).await;
    let contents: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(contents, json!(["eth/usdc", "eth/dai"]));
}

#[tokio::test]
async fn test_fs_empty_values_are_not_written() {
    setup();

    let cache_dir = tempdir();
    let shared_cache = fs_shared_cache(cache_dir.path());
    wait_init(&shared_cache).await;

    let config = persisted_config("pools");
    let key = persist_key(&config, &"sushiswap");
    let path = cache_dir.path().join(format!("{key}.json"));

    let producer = |_: &'static str| async { Ok::<Vec<String>, anyhow::Error>(vec![]) };
    let options = MemoizeOptions::new("pools", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let pools = wrap(producer, options);

    assert!(pools.call("sushiswap").await.unwrap().is_empty());
    assert!(!pools.contains(&"sushiswap").unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_fs_invalid_remote_value_is_ignored() {
    setup();

    let cache_dir = tempdir();
    let shared_cache = fs_shared_cache(cache_dir.path());
    wait_init(&shared_cache).await;

    let config = persisted_config("pools");
    let key = persist_key(&config, &"curve");
    let path = cache_dir.path().join(format!("{key}.json"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"[]").unwrap();

    let producer = |_: &'static str| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, anyhow::Error>(vec!["3pool".to_owned()])
    };
    let options = MemoizeOptions::new("pools", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let pools = wrap(producer, options);

    assert_eq!(pools.call("curve").await.unwrap(), vec!["3pool".to_owned()]);
}

#[tokio::test]
async fn test_http_shared_between_instances() {
    setup();

    let server = BlobServer::new(Some("secret"));
    let shared_cache = http_shared_cache(server.url(), "secret");
    wait_init(&shared_cache).await;

    let config = persisted_config("prices");
    let key = persist_key(&config, &"eth");

    let first = {
        let invocations = Invocations::default();
        let producer = move |_: &'static str| {
            invocations.record();
            async { Ok::<_, anyhow::Error>(3100.5) }
        };
        let options = MemoizeOptions::new("prices", config.clone())
            .clock(ManualClock::new(NOW))
            .shared_cache(shared_cache.clone());
        wrap(producer, options)
    };
    assert_eq!(first.call("eth").await.unwrap(), 3100.5);
    wait_for(|| server.get(&key).is_some()).await;
    assert_eq!(server.get(&key), Some(json!(3100.5)));

    // Another process starting up in the same epoch reads the value instead of computing it.
    let second_invocations = Invocations::default();
    let second = {
        let invocations = second_invocations.clone();
        let producer = move |_: &'static str| {
            invocations.record();
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(0.0)
            }
        };
        let options = MemoizeOptions::new("prices", config)
            .clock(ManualClock::new(NOW))
            .shared_cache(shared_cache);
        wrap(producer, options)
    };
    assert_ne!(first.instance(), second.instance());

    let price = tokio::time::timeout(Duration::from_secs(5), second.call("eth"))
        .await
        .unwrap();
    assert_eq!(price.unwrap(), 3100.5);
    assert_eq!(second_invocations.get(), 1);
    assert!(server.all_hits().iter().any(|(route, _)| route.starts_with("GET ")));
}

#[tokio::test]
async fn test_http_rejected_credentials() {
    setup();

    let server = BlobServer::new(Some("secret"));
    let shared_cache = http_shared_cache(server.url(), "wrong");
    wait_init(&shared_cache).await;

    let producer = |_: &'static str| async { Ok::<_, anyhow::Error>(1850.25) };
    let options = MemoizeOptions::new("prices", persisted_config("prices"))
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let prices = wrap(producer, options);

    assert_eq!(prices.call("eth").await.unwrap(), 1850.25);

    wait_for(|| server.accesses() > 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.keys().is_empty());
}

#[tokio::test]
async fn test_unpersisted_cache_ignores_shared_cache() {
    setup();

    let server = BlobServer::new(None);
    let shared_cache = http_shared_cache(server.url(), "secret");
    wait_init(&shared_cache).await;

    let mut config = persisted_config("prices");
    config.persist = None;

    let producer = |_: &'static str| async { Ok::<_, anyhow::Error>(1.0) };
    let options = MemoizeOptions::new("prices", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let prices = wrap(producer, options);

    assert_eq!(prices.call("dai").await.unwrap(), 1.0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_http_base_url_without_trailing_slash() {
    setup();

    let server = BlobServer::new(Some("secret"));
    let url = server.url().as_str().trim_end_matches('/').parse().unwrap();
    let shared_cache = http_shared_cache(url, "secret");
    wait_init(&shared_cache).await;

    let config = persisted_config("prices");
    let key = persist_key(&config, &"btc");
    server.insert(&key, json!(67000.0));

    let producer = |_: &'static str| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, anyhow::Error>(0.0)
    };
    let options = MemoizeOptions::new("prices", config)
        .clock(ManualClock::new(NOW))
        .shared_cache(shared_cache);
    let prices = wrap(producer, options);

    let price = tokio::time::timeout(Duration::from_secs(5), prices.call("btc"))
        .await
        .expect("the value should be read below the blobs path");
    assert_eq!(price.unwrap(), 67000.0);
    assert!(
        server
            .all_hits()
            .iter()
            .any(|(route, _)| route.starts_with("GET /blobs/prices/"))
    );
}
