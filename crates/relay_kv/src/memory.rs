//! In-memory backend with the same observable semantics as the Redis
//! store: per-key TTL, `*`/`?` glob matching, value-compare CAS.
//!
//! Single-process only. The gateway's hermetic tests share one instance
//! across "replicas" to exercise the distributed contracts.

use crate::{KvError, KvStore, ServerInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
    started: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    fn approximate_bytes(entries: &HashMap<String, Entry>) -> usize {
        entries
            .iter()
            .map(|(k, e)| {
                k.len()
                    + match &e.value {
                        Value::Str(s) => s.len(),
                        Value::Hash(h) => h.iter().map(|(f, v)| f.len() + v.len()).sum(),
                    }
            })
            .sum()
    }
}

/// Redis-style glob: `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.inner.lock().unwrap();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Hash(_)) => Err(KvError::Malformed(format!("{key} holds a hash"))),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.inner.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut entries = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if !entry.expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut entries = self.inner.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut entries = self.inner.lock().unwrap();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(Value::Str(_)) => Err(KvError::Malformed(format!("{key} holds a string"))),
            None => Ok(HashMap::new()),
        }
    }

    async fn hset_cas(
        &self,
        key: &str,
        watched: &[(&str, Option<&str>)],
        new: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut entries = self.inner.lock().unwrap();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
        let current = match entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => Some(h),
            Some(Value::Str(_)) => {
                return Err(KvError::Malformed(format!("{key} holds a string")))
            }
            None => None,
        };
        for (field, expected) in watched {
            let actual = current.and_then(|h| h.get(*field)).map(String::as_str);
            if actual != *expected {
                return Ok(false);
            }
        }
        let mut fields = current.cloned().unwrap_or_default();
        for (field, value) in new {
            fields.insert(field.to_string(), value.to_string());
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(fields),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn server_info(&self) -> Result<ServerInfo, KvError> {
        let entries = self.inner.lock().unwrap();
        Ok(ServerInfo {
            memory_human: format!("{}B", Self::approximate_bytes(&entries)),
            uptime_seconds: self.started.elapsed().as_secs(),
        })
    }
}
