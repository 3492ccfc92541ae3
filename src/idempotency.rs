use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First use of the key; the caller must `complete` or `release` it.
    Fresh,
    /// An earlier submission already produced this job.
    Existing(Uuid),
    /// An earlier submission with this key is still being accepted.
    Pending,
}

struct Entry {
    job: Option<Uuid>,
    at: Instant,
}

/// Maps client idempotency keys to the job they created. Uses Redis when
/// configured and an in-process map otherwise.
#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env(redis: Option<redis::Client>) -> Self {
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        Self::new(redis, Duration::from_secs(ttl))
    }

    pub async fn claim(&self, key: &str) -> Claim {
        if let Some(client) = &self.redis {
            match redis_claim(client, key, self.ttl).await {
                Ok(claim) => return claim,
                Err(err) => {
                    warn!(target = "wayover.api", error = %err, "idempotency_redis_unavailable");
                }
            }
        }
        let mut local = self.local.lock().await;
        let ttl = self.ttl;
        local.retain(|_, entry| entry.at.elapsed() < ttl);
        match local.get(key) {
            Some(Entry { job: Some(id), .. }) => Claim::Existing(*id),
            Some(Entry { job: None, .. }) => Claim::Pending,
            None => {
                local.insert(
                    key.to_string(),
                    Entry {
                        job: None,
                        at: Instant::now(),
                    },
                );
                Claim::Fresh
            }
        }
    }

    pub async fn complete(&self, key: &str, id: Uuid) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_complete(client, key, id, self.ttl).await
        {
            warn!(target = "wayover.api", key, error = %err, "idempotency_complete_failed");
            // Never leave the key at `pending`.
            if let Err(err) = redis_release(client, key).await {
                warn!(target = "wayover.api", key, error = %err, "idempotency_release_failed");
            }
        }
        let mut local = self.local.lock().await;
        match local.get_mut(key) {
            Some(entry) => entry.job = Some(id),
            None => {
                local.insert(
                    key.to_string(),
                    Entry {
                        job: Some(id),
                        at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Forgets a claim whose submission was rejected, so the key can be reused.
    pub async fn release(&self, key: &str) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_release(client, key).await
        {
            warn!(target = "wayover.api", key, error = %err, "idempotency_release_failed");
        }
        self.local.lock().await.remove(key);
    }
}

async fn redis_claim(
    client: &redis::Client,
    key: &str,
    ttl: Duration,
) -> Result<Claim, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(PENDING)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs())
        .query_async(&mut conn)
        .await?;
    if reply.is_some() {
        return Ok(Claim::Fresh);
    }
    let stored: Option<String> = conn.get(key).await?;
    Ok(stored
        .and_then(|value| Uuid::parse_str(&value).ok())
        .map(Claim::Existing)
        .unwrap_or(Claim::Pending))
}

async fn redis_complete(
    client: &redis::Client,
    key: &str,
    id: Uuid,
    ttl: Duration,
) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.set_ex::<_, _, ()>(key, id.to_string(), ttl.as_secs()).await
}

async fn redis_release(client: &redis::Client, key: &str) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.del::<_, ()>(key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_sees_the_first_job() {
        let store = IdempotencyStore::new(None, Duration::from_secs(60));
        assert_eq!(store.claim("u1:abc").await, Claim::Fresh);
        assert_eq!(store.claim("u1:abc").await, Claim::Pending);

        let id = Uuid::new_v4();
        store.complete("u1:abc", id).await;
        assert_eq!(store.claim("u1:abc").await, Claim::Existing(id));
        assert_eq!(store.claim("u2:abc").await, Claim::Fresh);
    }

    #[tokio::test]
    async fn released_keys_can_be_reused() {
        let store = IdempotencyStore::new(None, Duration::from_secs(60));
        assert_eq!(store.claim("k").await, Claim::Fresh);
        store.release("k").await;
        assert_eq!(store.claim("k").await, Claim::Fresh);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_the_local_map() {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let store = IdempotencyStore::new(Some(client), Duration::from_secs(60));
        assert_eq!(store.claim("k").await, Claim::Fresh);
        let id = Uuid::new_v4();
        store.complete("k", id).await;
        assert_eq!(store.claim("k").await, Claim::Existing(id));
        store.release("k").await;
        assert_eq!(store.claim("k").await, Claim::Fresh);
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = IdempotencyStore::new(None, Duration::from_millis(10));
        store.claim("k").await;
        store.complete("k", Uuid::new_v4()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.claim("k").await, Claim::Fresh);
    }
}
