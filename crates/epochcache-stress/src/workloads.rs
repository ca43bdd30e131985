use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use epochcache::caching::{MemoizeConfig, MemoizeOptions, SharedCacheRef};
use epochcache::config::Config;
use epochcache::{Memoized, wrap};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct arguments the workload calls the cache with.
    #[serde(default = "default_keys")]
    pub keys: u64,
    /// How long the producer takes to settle.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of producer invocations that fail, between `0` and `1`.
    #[serde(default, deserialize_with = "deserialize_failure_rate")]
    pub failure_rate: f64,
    pub cache: CacheSelection,
}

fn default_keys() -> u64 {
    1
}

fn deserialize_failure_rate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let rate = f64::deserialize(deserializer)?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(serde::de::Error::custom(format!(
            "failure_rate must be between 0 and 1, got {rate}"
        )));
    }
    Ok(rate)
}

/// Either the name of a cache in the service config, or an inline cache config.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CacheSelection {
    Named(String),
    Inline(MemoizeConfig),
}

/// A synthetic value, remembering which producer invocation computed it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Quote {
    pub key: u64,
    pub invocation: usize,
}

pub struct PreparedWorkload {
    pub concurrency: usize,
    keys: u64,
    memoized: Memoized<u64, Quote>,
    invocations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    /// The number of producer invocations so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn memoized(&self) -> &Memoized<u64, Quote> {
        &self.memoized
    }
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    service_config: &Config,
    shared_cache: SharedCacheRef,
) -> Result<PreparedWorkload> {
    let (name, config) = match workload.cache {
        CacheSelection::Named(name) => {
            let config = service_config
                .cache(&name)
                .with_context(|| format!("workload {index}: unknown cache `{name}`"))?
                .clone();
            (name, config)
        }
        CacheSelection::Inline(config) => (format!("workload-{index}"), config),
    };

    let invocations = Arc::new(AtomicUsize::new(0));
    let latency = workload.latency;
    let failure_rate = workload.failure_rate;
    let producer = {
        let invocations = Arc::clone(&invocations);
        move |key: u64| {
            let invocation = invocations.fetch_add(1, Ordering::Relaxed);
            let fails = rand::thread_rng().gen_bool(failure_rate);
            async move {
                tokio::time::sleep(latency).await;
                if fails {
                    anyhow::bail!("synthetic failure of invocation {invocation}");
                }
                Ok(Quote { key, invocation })
            }
        }
    };

    let options = MemoizeOptions::new(&name, config).shared_cache(shared_cache);
    Ok(PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        keys: workload.keys.max(1),
        memoized: wrap(producer, options),
        invocations,
    })
}

/// Calls the cache of `workload` with a random key, returning whether that succeeded.
pub async fn process_workload(workload: &PreparedWorkload) -> bool {
    let key = rand::thread_rng().gen_range(0..workload.keys);
    match workload.memoized.call(key).await {
        Ok(quote) => quote.key == key,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 100
                keys: 20
                latency: 50ms
                failure_rate: 0.1
                cache:
                  ttl: 1s
                  reject_when_no_cache: true
              - concurrency: 10
                latency: 2s
                cache: prices
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();

        let [inline, named] = &config.workloads[..] else {
            panic!("expected two workloads");
        };
        assert_eq!(inline.keys, 20);
        let CacheSelection::Inline(cache) = &inline.cache else {
            panic!("expected an inline cache");
        };
        assert_eq!(cache.ttl, Duration::from_secs(1));
        assert!(cache.reject_when_no_cache);

        assert_eq!(named.keys, 1);
        assert_eq!(named.failure_rate, 0.0);
        assert!(matches!(&named.cache, CacheSelection::Named(name) if name == "prices"));
    }

    #[test]
    fn test_invalid_failure_rate() {
        for rate in [".nan", ".inf", "1.5", "-0.1"] {
            let yaml = format!(
                "workloads:\n  - concurrency: 1\n    latency: 1ms\n    failure_rate: {rate}\n    cache: prices\n"
            );
            let err = serde_yaml::from_str::<WorkloadsConfig>(&yaml).unwrap_err();
            assert!(err.to_string().contains("failure_rate"), "{rate}: {err}");
        }

        let yaml = "workloads:\n  - concurrency: 1\n    latency: 1ms\n    failure_rate: 1\n    cache: prices\n";
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workloads[0].failure_rate, 1.0);
    }
}
