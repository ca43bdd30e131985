use std::time::Duration;

use epochcache::caching::{CacheError, ManualClock, MemoizeConfig, MemoizeOptions};
use epochcache::wrap;

use crate::{Invocations, setup};

/// Walks a cache through two epochs, with a stale value served in between.
#[tokio::test(start_paused = true)]
async fn test_counter_across_epochs() {
    setup();

    let clock = ManualClock::new(0);
    let invocations = Invocations::default();
    let producer = {
        let invocations = invocations.clone();
        move |_: ()| {
            let value = invocations.record();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, anyhow::Error>(value)
            }
        }
    };
    let options = MemoizeOptions::new("counter", MemoizeConfig::new(Duration::from_secs(1)))
        .clock(clock.clone());
    let counter = wrap(producer, options);

    assert_eq!(counter.call(()).await.unwrap(), 0);

    clock.set(500);
    assert_eq!(counter.call(()).await.unwrap(), 0);
    assert_eq!(invocations.get(), 1);

    // The next epoch starts computing, meanwhile the previous value is served.
    clock.set(1100);
    assert_eq!(counter.call(()).await.unwrap(), 0);
    assert_eq!(invocations.get(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(counter.call(()).await.unwrap(), 1);
    assert_eq!(invocations.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_producer_times_out() {
    setup();

    let clock = ManualClock::new(0);
    let invocations = Invocations::default();
    let producer = {
        let invocations = invocations.clone();
        move |_: ()| {
            let delay = match invocations.record() {
                0 => Duration::from_millis(200),
                _ => Duration::from_millis(10),
            };
            async move {
                tokio::time::sleep(delay).await;
                Ok::<_, anyhow::Error>("quote".to_owned())
            }
        }
    };
    let config = MemoizeConfig {
        request_timeout: Some(Duration::from_millis(50)),
        ..MemoizeConfig::new(Duration::from_secs(1))
    };
    let quotes = wrap(
        producer,
        MemoizeOptions::new("quotes", config).clock(clock.clone()),
    );

    let start = tokio::time::Instant::now();
    let err = quotes.call(()).await.unwrap_err();
    assert_eq!(err, CacheError::Timeout(Duration::from_millis(50)));
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(!quotes.contains(&()).unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(quotes.call(()).await.unwrap(), "quote");
    assert_eq!(invocations.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_warms_up() {
    setup();

    let clock = ManualClock::new(0);
    let invocations = Invocations::default();
    let producer = {
        let invocations = invocations.clone();
        move |token: &'static str| {
            invocations.record();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(format!("{token}-usd"))
            }
        }
    };
    let config = MemoizeConfig {
        reject_when_no_cache: true,
        ..MemoizeConfig::new(Duration::from_secs(60))
    };
    let rates = wrap(
        producer,
        MemoizeOptions::new("rates", config).clock(clock.clone()),
    );

    let err = rates.call("eth").await.unwrap_err();
    assert!(matches!(err, CacheError::NoCache { .. }));
    assert!(rates.contains(&"eth").unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(rates.call("eth").await.unwrap(), "eth-usd");
    assert_eq!(invocations.get(), 1);
}
