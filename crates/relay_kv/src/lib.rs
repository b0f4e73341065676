//! Shared key-value store client for the relay gateway.
//!
//! One trait, two backends:
//! - [`RedisStore`]: the production store every gateway replica shares,
//!   held as a process-wide singleton (init-on-first-use, ping probe,
//!   explicit close).
//! - [`MemoryStore`]: a single-process store with the same semantics,
//!   used by hermetic tests.
//!
//! The only concurrency primitive the gateway relies on is
//! [`KvStore::hset_cas`]: commit a set of hash fields plus a TTL iff the
//! watched fields still hold the values read earlier. Conflicting writers
//! observe `false` and retry.

mod error;
mod memory;
mod redis_store;

pub use error::KvError;
pub use memory::MemoryStore;
pub use redis_store::{RedisConfig, RedisStore};

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Store server health, surfaced by the gateway's admin stats endpoint.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub memory_human: String,
    pub uptime_seconds: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set `key` to `value` with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Delete the given keys. Returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    /// Keys matching a redis-style glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// All fields of the hash at `key`. Empty map when the key is absent.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    /// Optimistic commit: write `new` fields and set the key's TTL iff
    /// every watched field still holds the given value (`None` = field
    /// absent at read time). Returns `false` when the snapshot no longer
    /// matches and nothing was written.
    async fn hset_cas(
        &self,
        key: &str,
        watched: &[(&str, Option<&str>)],
        new: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<bool, KvError>;

    async fn server_info(&self) -> Result<ServerInfo, KvError>;
}
