//! Per-order mutual exclusion stored as rows in the downstream store.
//!
//! Acquisition is a single `conditional_insert`; losing the insert means the
//! caller is contended and must skip, never wait. Every row carries an expiry
//! so that a crashed holder cannot wedge an order forever:
//! - `acquire` reclaims an expired row once before giving up
//! - `LockSweeper` periodically deletes expired rows nobody tripped over
//!
//! Every delete is conditioned on the holder id read beforehand, so a row
//! that changed hands in between is never removed.

use crate::domain::records::{collections, BusinessKey, Fields};
use crate::infrastructure::store::{DownstreamStore, StoreError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(holder_id: Uuid, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id,
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_fields(&self) -> Result<Fields, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Corrupt(format!("lock info encoded as {}", other))),
        }
    }

    fn from_fields(fields: Fields) -> Option<Self> {
        serde_json::from_value(Value::Object(fields)).ok()
    }
}

/// Proof of a successful acquisition. Hand it back to `release`.
#[derive(Debug, Clone)]
pub struct LockGuard {
    key: BusinessKey,
    info: LockInfo,
}

impl LockGuard {
    pub fn key(&self) -> &BusinessKey {
        &self.key
    }

    pub fn holder_id(&self) -> Uuid {
        self.info.holder_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.info.expires_at
    }
}

#[derive(Clone)]
pub struct BackorderLock {
    store: Arc<dyn DownstreamStore>,
}

impl BackorderLock {
    pub fn new(store: Arc<dyn DownstreamStore>) -> Self {
        Self { store }
    }

    /// Returns `None` when another holder owns a live lock on `key`.
    pub async fn acquire(
        &self,
        key: &BusinessKey,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StoreError> {
        let info = LockInfo::new(Uuid::new_v4(), ttl);

        if self.try_insert(key, &info).await? {
            debug!(lock = %key, holder = %info.holder_id, "Lock acquired");
            return Ok(Some(LockGuard {
                key: key.clone(),
                info,
            }));
        }

        let existing = self.store.get(collections::BACKORDER_LOCKS, key).await?;
        let reclaimed = match existing {
            // Released between our insert and read.
            None => true,
            Some(fields) => match LockInfo::from_fields(fields.clone()) {
                Some(current) if current.is_expired() => {
                    warn!(
                        lock = %key,
                        holder = %current.holder_id,
                        expired_at = %current.expires_at,
                        "Reclaiming expired lock"
                    );
                    self.delete_held_by(key, current.holder_id).await?
                }
                Some(_) => false,
                None => {
                    warn!(lock = %key, "Reclaiming unreadable lock row");
                    self.store
                        .delete_if(collections::BACKORDER_LOCKS, key, &fields)
                        .await?
                }
            },
        };

        if !reclaimed {
            debug!(lock = %key, "Lock is held elsewhere");
            return Ok(None);
        }

        if self.try_insert(key, &info).await? {
            Ok(Some(LockGuard {
                key: key.clone(),
                info,
            }))
        } else {
            Ok(None)
        }
    }

    /// Deletes the row only while `holder_id` still owns it, so a row that
    /// was already reclaimed by someone else is left alone.
    async fn delete_held_by(&self, key: &BusinessKey, holder_id: Uuid) -> Result<bool, StoreError> {
        let mut expected = Fields::new();
        expected.insert(
            "holder_id".to_string(),
            Value::String(holder_id.to_string()),
        );
        self.store
            .delete_if(collections::BACKORDER_LOCKS, key, &expected)
            .await
    }

    async fn try_insert(&self, key: &BusinessKey, info: &LockInfo) -> Result<bool, StoreError> {
        self.store
            .conditional_insert(collections::BACKORDER_LOCKS, key, info.to_fields()?)
            .await
    }

    /// Deletes the lock row if it still belongs to `guard`. Releasing twice,
    /// or after the row was reclaimed by someone else, is a no-op.
    pub async fn release(&self, guard: &LockGuard) -> Result<(), StoreError> {
        if self.delete_held_by(&guard.key, guard.info.holder_id).await? {
            debug!(lock = %guard.key, "Lock released");
        } else {
            debug!(lock = %guard.key, "Lock no longer held at release");
        }
        Ok(())
    }

    /// Runs `f` only if the lock is acquired and releases it afterwards, also
    /// when `f` panics (the panic is resumed after release).
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &BusinessKey,
        ttl: Duration,
        f: F,
    ) -> Result<Option<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.acquire(key, ttl).await? else {
            return Ok(None);
        };

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release(&guard).await {
            error!(lock = %key, "Failed to release lock, it will expire: {}", e);
        }

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Deletes every expired lock row and returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let rows = self
            .store
            .query(collections::BACKORDER_LOCKS, &Fields::new())
            .await?;

        let mut removed = 0;
        for row in rows {
            let deleted = match LockInfo::from_fields(row.fields.clone()) {
                Some(info) if info.is_expired() => {
                    self.delete_held_by(&row.key, info.holder_id).await?
                }
                Some(_) => false,
                None => {
                    self.store
                        .delete_if(collections::BACKORDER_LOCKS, &row.key, &row.fields)
                        .await?
                }
            };
            if deleted {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Background task that clears expired lock rows until shutdown.
pub struct LockSweeper {
    lock: BackorderLock,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl LockSweeper {
    pub fn new(lock: BackorderLock, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            lock,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("LockSweeper started, interval {:?}", self.interval);

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("LockSweeper received shutdown signal. Exiting.");
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.lock.sweep_expired().await {
                Ok(0) => {}
                Ok(removed) => info!("Swept {} expired backorder locks", removed),
                Err(e) => error!("Error sweeping expired locks: {}", e),
            }
        }
        info!("LockSweeper stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::testing::{GatedOp, GatedStore};
    use crate::infrastructure::store::MemoryStore;

    fn lock_with_store() -> (BackorderLock, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (BackorderLock::new(store.clone()), store)
    }

    async fn plant_expired_lock(store: &MemoryStore, key: &BusinessKey) {
        let mut info = LockInfo::new(Uuid::new_v4(), Duration::from_secs(60));
        info.expires_at = Utc::now() - chrono::Duration::seconds(5);
        store
            .conditional_insert(collections::BACKORDER_LOCKS, key, info.to_fields().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_acquire_is_contended_until_release() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);

        let guard = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        assert!(lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().is_none());

        lock.release(&guard).await.unwrap();
        lock.release(&guard).await.unwrap();
        assert_eq!(store.len(collections::BACKORDER_LOCKS), 0);
        assert!(lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one_holder() {
        let (lock, _store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);

        let attempts = (0..16).map(|_| {
            let lock = lock.clone();
            let key = key.clone();
            tokio::spawn(async move { lock.acquire(&key, DEFAULT_LOCK_TTL).await })
        });
        let results = futures::future::join_all(attempts).await;

        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(Some(_)))))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed_on_acquire() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);
        plant_expired_lock(&store, &key).await;

        let guard = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap();
        assert!(guard.is_some());
    }

    #[tokio::test]
    async fn racing_reclaimers_of_an_expired_lock_admit_one_holder() {
        let store = Arc::new(GatedStore::new(GatedOp::Get, collections::BACKORDER_LOCKS, 2));
        let lock = BackorderLock::new(store.clone());
        let key = BusinessKey::new(["t1", "1001"]);
        plant_expired_lock(&store.inner, &key).await;

        // Both callers read the same expired row before either reclaims it.
        let (first, second) = tokio::join!(
            lock.acquire(&key, DEFAULT_LOCK_TTL),
            lock.acquire(&key, DEFAULT_LOCK_TTL)
        );

        let holders: Vec<LockGuard> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(holders.len(), 1);

        let row = store.get(collections::BACKORDER_LOCKS, &key).await.unwrap();
        assert_eq!(
            row.and_then(LockInfo::from_fields).map(|info| info.holder_id),
            Some(holders[0].holder_id())
        );
    }

    #[tokio::test]
    async fn sweep_spares_a_row_reclaimed_after_it_was_listed() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);
        plant_expired_lock(&store, &key).await;
        let stale = store.query(collections::BACKORDER_LOCKS, &Fields::new()).await.unwrap();

        let fresh = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        let stale_holder = LockInfo::from_fields(stale[0].fields.clone()).unwrap().holder_id;
        assert!(!lock.delete_held_by(&key, stale_holder).await.unwrap());

        let row = store.get(collections::BACKORDER_LOCKS, &key).await.unwrap();
        assert_eq!(
            row.and_then(LockInfo::from_fields).map(|info| info.holder_id),
            Some(fresh.holder_id())
        );
    }

    #[tokio::test]
    async fn release_leaves_a_reclaimed_lock_alone() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);

        let stale = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        store.delete(collections::BACKORDER_LOCKS, &key).await.unwrap();
        let fresh = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();

        lock.release(&stale).await.unwrap();
        let row = store.get(collections::BACKORDER_LOCKS, &key).await.unwrap();
        assert_eq!(
            row.and_then(LockInfo::from_fields).map(|info| info.holder_id),
            Some(fresh.holder_id())
        );
    }

    #[tokio::test]
    async fn with_lock_releases_after_error() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);

        let result = lock
            .with_lock(&key, DEFAULT_LOCK_TTL, || async {
                Err::<(), String>("write failed".to_string())
            })
            .await
            .unwrap();

        assert_eq!(result, Some(Err("write failed".to_string())));
        assert_eq!(store.len(collections::BACKORDER_LOCKS), 0);
    }

    #[tokio::test]
    async fn with_lock_releases_after_panic() {
        let (lock, store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);

        let task_lock = lock.clone();
        let task_key = key.clone();
        let joined = tokio::spawn(async move {
            task_lock
                .with_lock(&task_key, DEFAULT_LOCK_TTL, || async {
                    panic!("handler blew up");
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(store.len(collections::BACKORDER_LOCKS), 0);
    }

    #[tokio::test]
    async fn with_lock_skips_body_when_contended() {
        let (lock, _store) = lock_with_store();
        let key = BusinessKey::new(["t1", "1001"]);
        let _held = lock.acquire(&key, DEFAULT_LOCK_TTL).await.unwrap().unwrap();

        let result = lock
            .with_lock(&key, DEFAULT_LOCK_TTL, || async { 1 })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let (lock, store) = lock_with_store();
        let live = BusinessKey::new(["t1", "1"]);
        let dead = BusinessKey::new(["t1", "2"]);
        lock.acquire(&live, DEFAULT_LOCK_TTL).await.unwrap().unwrap();
        plant_expired_lock(&store, &dead).await;

        assert_eq!(lock.sweep_expired().await.unwrap(), 1);
        assert!(store.get(collections::BACKORDER_LOCKS, &live).await.unwrap().is_some());
        assert!(store.get(collections::BACKORDER_LOCKS, &dead).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let (lock, store) = lock_with_store();
        let dead = BusinessKey::new(["t1", "2"]);
        plant_expired_lock(&store, &dead).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            LockSweeper::new(lock, Duration::from_secs(30), shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.len(collections::BACKORDER_LOCKS), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
