// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Named mutual exclusion with expiry.
//!
//! Every acquisition carries an owner token. Only the owner may extend or
//! release the lock, so a holder whose TTL ran out cannot free a lock that
//! has since been taken by someone else.

use crate::error::SyncResult;
use async_trait::async_trait;
use oracle_sync_schema::PgStore;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes `name` for `ttl` on behalf of `owner` unless someone else holds
    /// it. Returns whether the lock was acquired.
    async fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool>;

    /// Pushes the expiry of a lock held by `owner` to `now + ttl`. Returns
    /// false when `owner` no longer holds it.
    async fn extend(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool>;

    /// Returns whether a lock held by `owner` was released.
    async fn release(&self, name: &str, owner: &str) -> SyncResult<bool>;
}

struct Holder {
    owner: String,
    expires_at: Instant,
}

/// Single process lock table. An expired entry counts as free, so a holder
/// that crashed without releasing blocks the name for at most one TTL.
#[derive(Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, Holder>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get(name) {
            Some(holder) if holder.expires_at > now => Ok(false),
            _ => {
                held.insert(
                    name.to_string(),
                    Holder {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn extend(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get_mut(name) {
            Some(holder) if holder.owner == owner && holder.expires_at > now => {
                holder.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> SyncResult<bool> {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some(holder) if holder.owner == owner => {
                held.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Lock table shared by every process pointed at the same database.
pub struct PgLock {
    store: PgStore,
}

impl PgLock {
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DistributedLock for PgLock {
    async fn acquire(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        Ok(self.store.try_lock(name, owner, ttl).await?)
    }

    async fn extend(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        Ok(self.store.extend_lock(name, owner, ttl).await?)
    }

    async fn release(&self, name: &str, owner: &str) -> SyncResult<bool> {
        Ok(self.store.unlock(name, owner).await?)
    }
}
