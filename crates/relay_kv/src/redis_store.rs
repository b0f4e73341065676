//! Redis backend: async connection manager, server-side CAS script, and
//! the process-wide singleton.

use crate::{KvError, KvStore, ServerInfo};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Connect and per-command response timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Compare-and-swap over hash fields. The async client cannot WATCH
/// safely on a multiplexed connection, so the optimistic transaction is
/// a server-side script: compare every watched field against the caller's
/// snapshot, then write and refresh the TTL in the same atomic step.
///
/// ARGV: n, (field, present-flag, expected)*n, m, (field, value)*m, ttl.
const CAS_SCRIPT: &str = r#"
local i = 2
local n = tonumber(ARGV[1])
for _ = 1, n do
  local cur = redis.call('HGET', KEYS[1], ARGV[i])
  if ARGV[i + 1] == '1' then
    if cur ~= ARGV[i + 2] then return 0 end
  else
    if cur then return 0 end
  end
  i = i + 3
end
local m = tonumber(ARGV[i])
i = i + 1
for _ = 1, m do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[i]))
return 1
"#;

/// Connection settings for the shared store.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("REDIS_HOST").unwrap_or(defaults.host),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            db: std::env::var("REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        }
    }

    fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    cas_script: Script,
}

static SHARED: Lazy<Mutex<Option<Arc<RedisStore>>>> = Lazy::new(|| Mutex::new(None));

impl RedisStore {
    /// Open a connection and probe it. Fails loudly when the server is
    /// unreachable; callers decide how to degrade.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, KvError> {
        let client = Client::open(cfg.url()).map_err(|e| KvError::Connect(e.to_string()))?;
        let manager_cfg = ConnectionManagerConfig::new()
            .set_connection_timeout(IO_TIMEOUT)
            .set_response_timeout(IO_TIMEOUT);
        let conn = ConnectionManager::new_with_config(client, manager_cfg)
            .await
            .map_err(|e| KvError::Connect(e.to_string()))?;
        let store = Self {
            conn,
            cas_script: Script::new(CAS_SCRIPT),
        };
        store.ping().await?;
        info!("store connection established ({}:{})", cfg.host, cfg.port);
        Ok(store)
    }

    /// Process-wide handle, established on first use.
    pub async fn shared(cfg: &RedisConfig) -> Result<Arc<Self>, KvError> {
        let mut guard = SHARED.lock().await;
        if let Some(store) = guard.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(Self::connect(cfg).await?);
        *guard = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Drop the shared handle. The next `shared()` call reconnects; tests
    /// and shutdown paths use this to avoid a stale connection outliving
    /// its server.
    pub async fn close_shared() {
        SHARED.lock().await.take();
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(KvError::Malformed(format!("unexpected PING reply: {pong}")))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hset_cas(
        &self,
        key: &str,
        watched: &[(&str, Option<&str>)],
        new: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas_script.key(key);
        invocation.arg(watched.len());
        for (field, expected) in watched {
            invocation.arg(*field);
            match expected {
                Some(value) => invocation.arg("1").arg(*value),
                None => invocation.arg("0").arg(""),
            };
        }
        invocation.arg(new.len());
        for (field, value) in new {
            invocation.arg(*field).arg(*value);
        }
        invocation.arg(ttl.as_secs().max(1));
        let committed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(committed == 1)
    }

    async fn server_info(&self) -> Result<ServerInfo, KvError> {
        let mut conn = self.conn.clone();
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        Ok(ServerInfo {
            memory_human: info_field(&raw, "used_memory_human")
                .unwrap_or("unknown")
                .to_string(),
            uptime_seconds: info_field(&raw, "uptime_in_seconds")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

fn info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .map(|v| v.trim_end_matches('\r'))
}
