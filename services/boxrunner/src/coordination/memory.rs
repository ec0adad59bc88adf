//! In-process coordination store.
//!
//! Mirrors the parts of Consul's session and KV semantics the runner relies on:
//! - Acquire is atomic and succeeds only if no live session holds the key
//! - Invalidating a session clears it from held keys and starts the lock-delay
//! - Blocking reads wake on any modification and return once the key's
//!   modify index passes the cursor
//!
//! Meant for tests and local dry runs. Several runners can share one store
//! through an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    CoordinationClient, CoordinationError, HealthCheckInfo, KvPair, SessionInfo,
    SERF_HEALTH_CHECK,
};

#[derive(Debug)]
struct StoredSession {
    name: String,
    lock_delay: Duration,
}

#[derive(Debug)]
struct StoredEntry {
    value: Vec<u8>,
    session: Option<String>,
    modify_index: u64,
    locked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    index: u64,
    next_session: u64,
    sessions: BTreeMap<String, StoredSession>,
    checks: BTreeMap<String, String>,
    kv: HashMap<String, StoredEntry>,
    unavailable: bool,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn ensure_available(&self) -> Result<(), CoordinationError> {
        if self.unavailable {
            return Err(CoordinationError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

/// Coordination store kept in memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store carrying only the node-level `serfHealth` check.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner
            .checks
            .insert(SERF_HEALTH_CHECK.to_string(), String::new());
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(inner),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: u64) {
        self.changes.send_replace(index);
    }

    /// Destroy a session the way a failing health check would.
    ///
    /// Keys held by the session lose their holder and cannot be acquired
    /// again until the session's lock-delay has passed.
    pub fn invalidate_session(&self, session: &str) -> bool {
        let mut inner = self.lock();
        let Some(stored) = inner.sessions.remove(session) else {
            return false;
        };

        let now = Instant::now();
        let held: Vec<String> = inner
            .kv
            .iter()
            .filter(|(_, e)| e.session.as_deref() == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for key in held {
            let index = inner.bump();
            if let Some(entry) = inner.kv.get_mut(&key) {
                entry.session = None;
                entry.modify_index = index;
                entry.locked_until = Some(now + stored.lock_delay);
            }
        }
        let index = inner.bump();
        drop(inner);

        info!(session = session, name = %stored.name, "Session invalidated");
        self.publish(index);
        true
    }

    /// Make every call fail (or succeed again).
    ///
    /// Blocked readers are woken and observe the outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.lock();
        inner.unavailable = unavailable;
        let index = inner.bump();
        drop(inner);
        self.publish(index);
    }

    /// Value stored under `key` while some session holds it.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.lock()
            .kv
            .get(key)
            .filter(|e| e.session.is_some())
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of registered health checks, `serfHealth` included.
    pub fn check_count(&self) -> usize {
        self.lock().checks.len()
    }
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn create_session(
        &self,
        name: &str,
        checks: &[String],
        lock_delay: Duration,
    ) -> Result<String, CoordinationError> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        if let Some(missing) = checks.iter().find(|c| !inner.checks.contains_key(*c)) {
            return Err(CoordinationError::Api {
                status: 500,
                message: format!("Missing check '{missing}' registration"),
            });
        }

        inner.next_session += 1;
        let id = format!("session-{:08}", inner.next_session);
        inner.sessions.insert(
            id.clone(),
            StoredSession {
                name: name.to_string(),
                lock_delay,
            },
        );
        debug!(session = %id, name = name, "Session created");
        Ok(id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, CoordinationError> {
        let inner = self.lock();
        inner.ensure_available()?;
        Ok(inner
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                name: s.name.clone(),
            })
            .collect())
    }

    async fn register_health_check(
        &self,
        id: &str,
        url: &str,
        _interval: Duration,
    ) -> Result<(), CoordinationError> {
        let mut inner = self.lock();
        inner.ensure_available()?;
        inner.checks.insert(id.to_string(), url.to_string());
        Ok(())
    }

    async fn list_health_checks(&self) -> Result<Vec<HealthCheckInfo>, CoordinationError> {
        let inner = self.lock();
        inner.ensure_available()?;
        Ok(inner
            .checks
            .keys()
            .map(|id| HealthCheckInfo { id: id.clone() })
            .collect())
    }

    async fn kv_get(
        &self,
        key: &str,
        wait_index: Option<u64>,
    ) -> Result<Option<KvPair>, CoordinationError> {
        // Subscribe before reading so a change between the read and the wait
        // is not missed.
        let mut changes = self.changes.subscribe();

        loop {
            {
                let inner = self.lock();
                inner.ensure_available()?;

                let Some(entry) = inner.kv.get(key) else {
                    return Ok(None);
                };
                if wait_index.is_none_or(|index| entry.modify_index > index) {
                    return Ok(Some(KvPair {
                        key: key.to_string(),
                        value: entry.value.clone(),
                        session: entry.session.clone(),
                        modify_index: entry.modify_index,
                    }));
                }
            }

            if changes.changed().await.is_err() {
                return Err(CoordinationError::Unavailable(
                    "memory store dropped".to_string(),
                ));
            }
        }
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> Result<bool, CoordinationError> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        if !inner.sessions.contains_key(session) {
            return Err(CoordinationError::Api {
                status: 500,
                message: format!("invalid session \"{session}\""),
            });
        }

        if let Some(entry) = inner.kv.get(key) {
            match entry.session.as_deref() {
                Some(holder) if holder != session => return Ok(false),
                Some(_) => {}
                None => {
                    if entry.locked_until.is_some_and(|until| Instant::now() < until) {
                        debug!(key = key, "Key is inside its lock-delay");
                        return Ok(false);
                    }
                }
            }
        }

        let index = inner.bump();
        inner.kv.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_vec(),
                session: Some(session.to_string()),
                modify_index: index,
                locked_until: None,
            },
        );
        drop(inner);

        self.publish(index);
        Ok(true)
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        let held = inner
            .kv
            .get(key)
            .is_some_and(|e| e.session.as_deref() == Some(session));
        if !held {
            return Ok(false);
        }

        let index = inner.bump();
        if let Some(entry) = inner.kv.get_mut(key) {
            entry.session = None;
            entry.modify_index = index;
        }
        drop(inner);

        self.publish(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn session(store: &MemoryStore, name: &str, lock_delay: Duration) -> String {
        store
            .create_session(name, &[SERF_HEALTH_CHECK.to_string()], lock_delay)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = MemoryStore::new();
        let a = session(&store, "a", Duration::ZERO).await;
        let b = session(&store, "b", Duration::ZERO).await;

        assert!(store.kv_acquire("web", b"a", &a).await.unwrap());
        assert!(!store.kv_acquire("web", b"b", &b).await.unwrap());
        // Re-acquire by the holder succeeds.
        assert!(store.kv_acquire("web", b"a", &a).await.unwrap());
        assert_eq!(store.holder("web").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryStore::new();
        let a = session(&store, "a", Duration::ZERO).await;
        let b = session(&store, "b", Duration::ZERO).await;

        store.kv_acquire("web", b"a", &a).await.unwrap();
        assert!(!store.kv_release("web", &b).await.unwrap());
        assert!(store.kv_release("web", &a).await.unwrap());
        assert_eq!(store.holder("web"), None);
        assert!(store.kv_acquire("web", b"b", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_session_cannot_acquire() {
        let store = MemoryStore::new();
        let result = store.kv_acquire("web", b"x", "nope").await;
        assert!(matches!(result, Err(CoordinationError::Api { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_session_requires_registered_checks() {
        let store = MemoryStore::new();
        let checks = vec![SERF_HEALTH_CHECK.to_string(), "runner".to_string()];
        assert!(store
            .create_session("runner", &checks, Duration::ZERO)
            .await
            .is_err());

        store
            .register_health_check("runner", "http://localhost:8080/health", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store
            .create_session("runner", &checks, Duration::ZERO)
            .await
            .is_ok());
        assert_eq!(store.check_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_delay_after_invalidation() {
        let store = MemoryStore::new();
        let a = session(&store, "a", Duration::from_secs(5)).await;
        let b = session(&store, "b", Duration::ZERO).await;

        store.kv_acquire("web", b"a", &a).await.unwrap();
        assert!(store.invalidate_session(&a));
        assert!(!store.invalidate_session(&a));
        assert_eq!(store.holder("web"), None);

        assert!(!store.kv_acquire("web", b"b", &b).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.kv_acquire("web", b"b", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_key_returns_immediately() {
        let store = MemoryStore::new();
        assert_eq!(store.kv_get("web", Some(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_change() {
        let store = Arc::new(MemoryStore::new());
        let a = session(&store, "a", Duration::ZERO).await;
        store.kv_acquire("web", b"a", &a).await.unwrap();
        let first = store.kv_get("web", None).await.unwrap().unwrap();

        let reader = tokio::spawn({
            let store = Arc::clone(&store);
            let index = first.modify_index;
            async move { store.kv_get("web", Some(index)).await }
        });

        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        store.kv_release("web", &a).await.unwrap();
        let pair = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(pair.session, None);
        assert!(pair.modify_index > first.modify_index);
    }

    #[tokio::test]
    async fn test_outage_wakes_blocked_reader() {
        let store = Arc::new(MemoryStore::new());
        let a = session(&store, "a", Duration::ZERO).await;
        store.kv_acquire("web", b"a", &a).await.unwrap();
        let first = store.kv_get("web", None).await.unwrap().unwrap();

        let reader = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.kv_get("web", Some(first.modify_index)).await }
        });
        tokio::task::yield_now().await;

        store.set_unavailable(true);
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(CoordinationError::Unavailable(_))));
    }
}
