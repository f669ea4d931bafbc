use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// average for all commands is <10ms, so 1s is plenty of headroom
const REDIS_TIMEOUT_MILLISECS: u64 = 1000;

#[derive(Error, Debug)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,

    #[error("Redis error: {0}")]
    Other(#[from] redis::RedisError),

    #[error("Timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// A simplified redis wrapper: just the commands the resolver and the
/// counter/override stores need. Every command runs under a timeout so a
/// stuck redis can't wedge the request path.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    /// SETEX: set with a TTL in seconds.
    async fn set_ex(&self, k: String, v: String, ttl_secs: u64) -> Result<(), CustomRedisError>;
    /// INCR: atomic increment, returns the post-increment value.
    async fn incr(&self, k: String) -> Result<i64, CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    /// KEYS with a `prefix*` pattern. Only used by admin operations,
    /// never on the hot path.
    async fn keys_by_prefix(&self, prefix: String) -> Result<Vec<String>, CustomRedisError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get::<_, Option<String>>(k);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        match fut? {
            Some(value) => Ok(value),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set(k, v);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }

    async fn set_ex(&self, k: String, v: String, ttl_secs: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set_ex(k, v, ttl_secs as usize);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }

    async fn incr(&self, k: String) -> Result<i64, CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.incr(k, 1);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.del(k);
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }

    async fn keys_by_prefix(&self, prefix: String) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.keys(format!("{}*", prefix));
        let fut = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await?;

        Ok(fut?)
    }
}

/// In-memory stand-in for redis, used by tests. Unlike a canned-response
/// mock this one keeps real state, so counter behavior (INCR, reset) can
/// be exercised end to end. `set_unavailable` simulates an unreachable
/// store for failure-path tests.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<HashMap<String, String>>>,
    fail_all: Arc<Mutex<bool>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Default::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.fail_all.lock().unwrap() = unavailable;
    }

    fn check_available(&self) -> Result<(), CustomRedisError> {
        if *self.fail_all.lock().unwrap() {
            return Err(CustomRedisError::Other(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "mock redis unavailable",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        match state.get(&k) {
            Some(value) => Ok(value.clone()),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        self.check_available()?;
        self.state.lock().unwrap().insert(k, v);
        Ok(())
    }

    async fn set_ex(&self, k: String, v: String, _ttl_secs: u64) -> Result<(), CustomRedisError> {
        // TTL expiry isn't simulated, writes just land in the map
        self.check_available()?;
        self.state.lock().unwrap().insert(k, v);
        Ok(())
    }

    async fn incr(&self, k: String) -> Result<i64, CustomRedisError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let current: i64 = state.get(&k).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + 1;
        state.insert(k, next.to_string());
        Ok(next)
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.check_available()?;
        self.state.lock().unwrap().remove(&k);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: String) -> Result<Vec<String>, CustomRedisError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
