#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;

pub use caching::{
    CacheEntry, CacheError, MemoizeConfig, MemoizeOptions, Memoized, PersistConfig, wrap,
};
