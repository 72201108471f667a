#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::utils::errors::EngineError;
use crate::utils::sbs_utils::timestamp_utc;

// ***************************************************************************
//                          Constants and Types
// ***************************************************************************
const LOCK_KEY_PREFIX: &str = "lock:";

// Compare-and-delete: remove the key only while it still carries the
// caller's token.  Runs atomically server-side.
const RELEASE_IF_TOKEN_MATCHES: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, data = pcall(cjson.decode, raw)
if ok and data.token == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// ---------------------------------------------------------------------------
// SeatLock:
// ---------------------------------------------------------------------------
/// The ephemeral lock value stored at `lock:{seat_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatLock {
    pub token: String,
    pub user_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SeatLock {
    /// A lock is live while its expiry is strictly in the future.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Remaining lifetime in whole seconds, rounded up, floored at zero.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        let ms = (self.expires_at - now).num_milliseconds();
        if ms <= 0 {
            0
        } else {
            (ms + 999) / 1000
        }
    }
}

// ---------------------------------------------------------------------------
// AcquireOutcome:
// ---------------------------------------------------------------------------
#[derive(Debug)]
pub enum AcquireOutcome {
    /// This caller now holds the seat.
    Acquired(SeatLock),
    /// Another caller holds the seat; retry after the remaining TTL.
    AlreadyHeld { expires_in: i64 },
}

// ---------------------------------------------------------------------------
// lock_key:
// ---------------------------------------------------------------------------
pub fn lock_key(seat_id: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, seat_id)
}

// ***************************************************************************
//                             LockStore Trait
// ***************************************************************************
/** The only atomic gate deciding which single requester gets a seat.  The
 * contract: under arbitrary concurrent acquire calls for one seat exactly
 * one caller receives Acquired and every other caller receives AlreadyHeld,
 * and a token-qualified release never deletes a lock the caller does not
 * own.  Store outages surface as StoreUnavailable, never as silent success.
 */
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic create-if-absent-with-expiry under a fresh reservation token.
    async fn acquire(
        &self,
        seat_id: &str,
        user_id: &str,
        ttl_seconds: u64,
    ) -> Result<AcquireOutcome, EngineError>;

    /// The current lock value, if any, without mutation.
    async fn inspect(&self, seat_id: &str) -> Result<Option<SeatLock>, EngineError>;

    /// True iff a live lock exists with a matching token and user.
    async fn verify(&self, seat_id: &str, token: &str, user_id: &str)
        -> Result<bool, EngineError>;

    /// Delete the lock; with an expected token this is compare-and-delete.
    /// Returns whether a key was removed.
    async fn release(&self, seat_id: &str, expected_token: Option<&str>)
        -> Result<bool, EngineError>;

    /// Point-in-time batch existence check, one round trip.
    async fn bulk_exists(&self, seat_ids: &[String])
        -> Result<HashMap<String, bool>, EngineError>;
}

// ---------------------------------------------------------------------------
// open_lock_store:
// ---------------------------------------------------------------------------
/** Build the configured lock store.  "memory" selects the in-process store
 * (development, tests); redis:// urls select the Redis store, credentials
 * embedded in the url.
 */
pub async fn open_lock_store(url: &str) -> Result<Arc<dyn LockStore>> {
    if url == "memory" {
        return Ok(Arc::new(MemoryLockStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisLockStore::new(url).await?;
        return Ok(Arc::new(store));
    }
    Err(anyhow!("Unrecognized lock_store_url: {}", url))
}

// ***************************************************************************
//                             Redis Lock Store
// ***************************************************************************
/** Redis-backed store.  Acquire is a single SET NX EX; remaining TTL comes
 * from TTL; compare-and-delete runs as a Lua script; bulk existence is one
 * MGET.  Redis expiry removes lock keys without any action on our side.
 */
#[derive(Clone)]
pub struct RedisLockStore {
    conn_manager: ConnectionManager,
}

impl RedisLockStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| anyhow!("Failed to create Redis connection manager: {}", e))?;
        Ok(Self { conn_manager })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire(
        &self,
        seat_id: &str,
        user_id: &str,
        ttl_seconds: u64,
    ) -> Result<AcquireOutcome, EngineError> {
        let mut conn = self.conn_manager.clone();
        let key = lock_key(seat_id);

        let now = timestamp_utc();
        let lock = SeatLock {
            token: Uuid::new_v4().as_hyphenated().to_string(),
            user_id: user_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
        };
        let encoded = serde_json::to_string(&lock)
            .map_err(|e| EngineError::StoreUnavailable(format!("lock encode: {}", e)))?;

        // SET key value NX EX ttl: the whole create-if-absent-with-expiry
        // in one atomic command.
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&encoded)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        if set.is_some() {
            return Ok(AcquireOutcome::Acquired(lock));
        }

        // Somebody else holds the seat; report the remaining TTL.  A
        // non-positive TTL means the holder vanished between our two
        // commands; the caller retries almost immediately.
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        Ok(AcquireOutcome::AlreadyHeld { expires_in: ttl.max(1) })
    }

    async fn inspect(&self, seat_id: &str) -> Result<Option<SeatLock>, EngineError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> =
            redis::cmd("GET").arg(lock_key(seat_id)).query_async(&mut conn).await?;
        match raw {
            Some(s) => match serde_json::from_str::<SeatLock>(&s) {
                Ok(lock) => Ok(Some(lock)),
                Err(e) => {
                    // Only this server writes lock values; an undecodable
                    // value means key-space corruption.
                    warn!("Undecodable lock value for seat {}: {}", seat_id, e);
                    Err(EngineError::StoreUnavailable(format!("lock decode: {}", e)))
                }
            },
            None => Ok(None),
        }
    }

    async fn verify(
        &self,
        seat_id: &str,
        token: &str,
        user_id: &str,
    ) -> Result<bool, EngineError> {
        match self.inspect(seat_id).await? {
            Some(lock) => Ok(lock.token == token
                && lock.user_id == user_id
                && lock.is_live(timestamp_utc())),
            None => Ok(false),
        }
    }

    async fn release(
        &self,
        seat_id: &str,
        expected_token: Option<&str>,
    ) -> Result<bool, EngineError> {
        let mut conn = self.conn_manager.clone();
        let key = lock_key(seat_id);
        let removed: i64 = match expected_token {
            Some(token) => {
                let script = redis::Script::new(RELEASE_IF_TOKEN_MATCHES);
                script.key(&key).arg(token).invoke_async(&mut conn).await?
            }
            None => redis::cmd("DEL").arg(&key).query_async(&mut conn).await?,
        };
        Ok(removed > 0)
    }

    async fn bulk_exists(
        &self,
        seat_ids: &[String],
    ) -> Result<HashMap<String, bool>, EngineError> {
        if seat_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn_manager.clone();
        let mut cmd = redis::cmd("MGET");
        for seat_id in seat_ids {
            cmd.arg(lock_key(seat_id));
        }
        let values: Vec<Option<String>> = cmd.query_async(&mut conn).await?;
        Ok(seat_ids
            .iter()
            .zip(values)
            .map(|(seat_id, v)| (seat_id.clone(), v.is_some()))
            .collect())
    }
}

// ***************************************************************************
//                            Memory Lock Store
// ***************************************************************************
/** In-process store with the same semantics, used for development and in
 * the engine tests.  Expired entries are treated as absent everywhere and
 * lazily purged, emulating the backing store's auto-expiry.
 */
#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, SeatLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SeatLock>>, EngineError> {
        self.locks
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("lock table poisoned".to_string()))
    }

    // Test hook for planting lock values with chosen expiries.
    #[cfg(test)]
    pub fn insert_raw(&self, seat_id: &str, lock: SeatLock) {
        self.locks.lock().unwrap().insert(seat_id.to_string(), lock);
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(
        &self,
        seat_id: &str,
        user_id: &str,
        ttl_seconds: u64,
    ) -> Result<AcquireOutcome, EngineError> {
        let now = timestamp_utc();
        let mut locks = self.guard()?;

        if let Some(existing) = locks.get(seat_id) {
            if existing.is_live(now) {
                return Ok(AcquireOutcome::AlreadyHeld {
                    expires_in: existing.remaining_seconds(now).max(1),
                });
            }
            // Auto-expired; fall through and overwrite.
        }

        let lock = SeatLock {
            token: Uuid::new_v4().as_hyphenated().to_string(),
            user_id: user_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
        };
        locks.insert(seat_id.to_string(), lock.clone());
        Ok(AcquireOutcome::Acquired(lock))
    }

    async fn inspect(&self, seat_id: &str) -> Result<Option<SeatLock>, EngineError> {
        let now = timestamp_utc();
        let mut locks = self.guard()?;
        match locks.get(seat_id) {
            Some(lock) if lock.is_live(now) => Ok(Some(lock.clone())),
            Some(_) => {
                locks.remove(seat_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn verify(
        &self,
        seat_id: &str,
        token: &str,
        user_id: &str,
    ) -> Result<bool, EngineError> {
        let now = timestamp_utc();
        let locks = self.guard()?;
        Ok(locks
            .get(seat_id)
            .map(|lock| lock.token == token && lock.user_id == user_id && lock.is_live(now))
            .unwrap_or(false))
    }

    async fn release(
        &self,
        seat_id: &str,
        expected_token: Option<&str>,
    ) -> Result<bool, EngineError> {
        let mut locks = self.guard()?;
        match expected_token {
            Some(token) => {
                let matches = locks.get(seat_id).map(|l| l.token == token).unwrap_or(false);
                if matches {
                    locks.remove(seat_id);
                }
                Ok(matches)
            }
            None => Ok(locks.remove(seat_id).is_some()),
        }
    }

    async fn bulk_exists(
        &self,
        seat_ids: &[String],
    ) -> Result<HashMap<String, bool>, EngineError> {
        let now = timestamp_utc();
        let locks = self.guard()?;
        Ok(seat_ids
            .iter()
            .map(|seat_id| {
                let held = locks.get(seat_id).map(|l| l.is_live(now)).unwrap_or(false);
                (seat_id.clone(), held)
            })
            .collect())
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_already_held() {
        let store = MemoryLockStore::new();
        let first = store.acquire("S1", "alice", 120).await.unwrap();
        let lock = match first {
            AcquireOutcome::Acquired(l) => l,
            other => panic!("expected Acquired, got {:?}", other),
        };
        assert_eq!(lock.user_id, "alice");

        match store.acquire("S1", "bob", 120).await.unwrap() {
            AcquireOutcome::AlreadyHeld { expires_in } => {
                assert!(expires_in > 0 && expires_in <= 120);
            }
            other => panic!("expected AlreadyHeld, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exactly_one_of_ten_concurrent_acquires_wins() {
        let store = Arc::new(MemoryLockStore::new());
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.acquire("S1", &format!("user-{}", i), 120).await.unwrap()
                })
            })
            .collect();

        let mut acquired = 0;
        let mut held = 0;
        for t in tasks {
            match t.await.unwrap() {
                AcquireOutcome::Acquired(_) => acquired += 1,
                AcquireOutcome::AlreadyHeld { expires_in } => {
                    assert!(expires_in > 0 && expires_in <= 120);
                    held += 1;
                }
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(held, 9);
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = MemoryLockStore::new();
        let lock = match store.acquire("S1", "alice", 120).await.unwrap() {
            AcquireOutcome::Acquired(l) => l,
            other => panic!("expected Acquired, got {:?}", other),
        };

        // Wrong token never deletes the holder's lock.
        assert!(!store.release("S1", Some("not-the-token")).await.unwrap());
        assert!(store.verify("S1", &lock.token, "alice").await.unwrap());

        assert!(store.release("S1", Some(&lock.token)).await.unwrap());
        assert!(!store.verify("S1", &lock.token, "alice").await.unwrap());
        assert!(store.inspect("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_checks_token_user_and_expiry() {
        let store = MemoryLockStore::new();
        let lock = match store.acquire("S1", "alice", 120).await.unwrap() {
            AcquireOutcome::Acquired(l) => l,
            other => panic!("expected Acquired, got {:?}", other),
        };
        assert!(store.verify("S1", &lock.token, "alice").await.unwrap());
        assert!(!store.verify("S1", &lock.token, "bob").await.unwrap());
        assert!(!store.verify("S1", "other-token", "alice").await.unwrap());
        assert!(!store.verify("S2", &lock.token, "alice").await.unwrap());
    }

    #[tokio::test]
    async fn expiry_boundary_is_strict() {
        let store = MemoryLockStore::new();
        let now = timestamp_utc();
        // A lock expiring exactly now must not verify and must not block
        // a new acquire.
        store.insert_raw(
            "S1",
            SeatLock {
                token: "tok".to_string(),
                user_id: "alice".to_string(),
                acquired_at: now - chrono::Duration::seconds(120),
                expires_at: now,
            },
        );
        assert!(!store.verify("S1", "tok", "alice").await.unwrap());
        match store.acquire("S1", "bob", 120).await.unwrap() {
            AcquireOutcome::Acquired(_) => (),
            other => panic!("expired lock should not block acquire: {:?}", other),
        }
    }

    #[tokio::test]
    async fn expired_lock_disappears_without_action() {
        let store = MemoryLockStore::new();
        match store.acquire("S1", "alice", 1).await.unwrap() {
            AcquireOutcome::Acquired(_) => (),
            other => panic!("expected Acquired, got {:?}", other),
        }
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store.inspect("S1").await.unwrap().is_none());
        let exists = store.bulk_exists(&["S1".to_string()]).await.unwrap();
        assert_eq!(exists.get("S1"), Some(&false));
    }

    #[tokio::test]
    async fn bulk_exists_reports_per_seat() {
        let store = MemoryLockStore::new();
        store.acquire("S1", "alice", 120).await.unwrap();
        let ids = vec!["S1".to_string(), "S2".to_string()];
        let exists = store.bulk_exists(&ids).await.unwrap();
        assert_eq!(exists.get("S1"), Some(&true));
        assert_eq!(exists.get("S2"), Some(&false));
    }
}
