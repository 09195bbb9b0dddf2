#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! VenueLens Shared
//!
//! Building blocks used by every VenueLens binary: the counter store,
//! plan/subscription enums, environment configuration and the Postgres pool.

pub mod config;
pub mod counter;
pub mod db;
pub mod types;

pub use config::{ConfigError, CounterStoreConfig, ResetConfig};
pub use counter::{
    connect_counter_store, usage_key, yearly_reset_key, yearly_reset_pattern, CounterError,
    CounterResult, CounterStore, DegradedCounterStore, KeyTtl, MemoryCounterStore,
    RedisCounterStore,
};
pub use db::{create_pool, run_migrations};
pub use types::{BillingInterval, SubscriptionStatus, Tier};
