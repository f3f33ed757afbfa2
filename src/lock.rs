//! Named, non-blocking run locks.
//!
//! A run lock keeps two invocations for the same source from overlapping.
//! Failing to acquire one is not an error: it means another run is already
//! in flight.

use crate::error::Result;
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[async_trait]
pub trait RunLock: Send + Sync {
    /// Try to take `name` for at most `ttl`. Never waits for a holder.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool>;

    /// Release `name` if this instance holds it.
    async fn release(&self, name: &str) -> Result<()>;
}

/// In-process lock table with expiring entries.
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(name).is_some_and(|expires| *expires > Instant::now())
    }
}

#[async_trait]
impl RunLock for MemoryLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(name) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                held.insert(name.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(name);
        Ok(())
    }
}

// Deletes the key only while it still carries our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const LOCK_KEY_PREFIX: &str = "lock:";

/// Redis-backed lock using `SET NX PX` and a per-holder token.
pub struct RedisLock {
    client: redis::Client,
    tokens: Mutex<HashMap<String, String>>,
}

impl RedisLock {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn new_token() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl RunLock for RedisLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = Self::new_token();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{LOCK_KEY_PREFIX}{name}"))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            tokens.insert(name.to_string(), token);
            debug!(lock = name, "Acquired lock");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let token = {
            let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            tokens.remove(name)
        };
        let Some(token) = token else {
            warn!(lock = name, "Releasing a lock this instance does not hold");
            return Ok(());
        };

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script
            .key(format!("{LOCK_KEY_PREFIX}{name}"))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!(lock = name, "Lock expired before release");
        }
        Ok(())
    }
}
