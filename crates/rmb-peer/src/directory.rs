//! Twin directory: provider interface, lookup cache and an in-memory provider.
//!
//! The directory maps a twin id to the twin's account key, the relay
//! hostnames it is reachable through and its E2E public key. Production
//! deployments back it with the chain; [`MemoryDirectory`] serves tests and
//! single-host setups.

use crate::error::DirectoryError;
use async_trait::async_trait;
use dashmap::DashMap;
use rmb_common::{Signer, TwinId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Twin {
    /// Twin id.
    pub id: TwinId,
    /// 32-byte account key that signs this twin's envelopes.
    pub account: Vec<u8>,
    /// `_`-joined relay hostnames the twin is connected to.
    pub relay: Option<String>,
    /// Compressed secp256k1 E2E public key.
    pub e2e_key: Option<Vec<u8>>,
}

impl Twin {
    /// The E2E key, if one is published and non-empty.
    #[must_use]
    pub fn e2e_key(&self) -> Option<&[u8]> {
        self.e2e_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Source of truth for twin records.
#[async_trait]
pub trait DirectoryProvider: Send + Sync + 'static {
    /// Fetches the record of twin `id`.
    async fn get_twin(&self, id: TwinId) -> Result<Twin, DirectoryError>;

    /// Resolves an account key to its twin id.
    async fn get_twin_by_pubkey(&self, pubkey: &[u8]) -> Result<TwinId, DirectoryError>;

    /// Publishes relay hostnames and E2E key for the twin owned by `signer`.
    async fn update_twin(
        &self,
        signer: &Signer,
        relay: &str,
        e2e_key: &[u8],
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug)]
struct Cached {
    twin: Arc<Twin>,
    fetched_at: Instant,
}

/// Read-through cache in front of a [`DirectoryProvider`].
///
/// Lookups by id are cached (forever by default); reverse lookups by key go
/// straight to the provider.
pub struct DirectoryCache {
    provider: Arc<dyn DirectoryProvider>,
    entries: DashMap<TwinId, Cached>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DirectoryCache {
    /// Cache that keeps entries until invalidated.
    #[must_use]
    pub fn new(provider: Arc<dyn DirectoryProvider>) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
            ttl: None,
        }
    }

    /// Cache whose entries are refetched once older than `ttl`.
    #[must_use]
    pub fn with_ttl(provider: Arc<dyn DirectoryProvider>, ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            ..Self::new(provider)
        }
    }

    /// Returns the record of twin `id`, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] for unknown ids, or the provider failure.
    pub async fn get(&self, id: TwinId) -> Result<Arc<Twin>, DirectoryError> {
        let hit = self.entries.get(&id).and_then(|entry| {
            let fresh = self
                .ttl
                .map_or(true, |ttl| entry.fetched_at.elapsed() < ttl);
            fresh.then(|| Arc::clone(&entry.twin))
        });
        if let Some(twin) = hit {
            return Ok(twin);
        }

        let twin = Arc::new(self.provider.get_twin(id).await?);
        debug!(twin = id, "directory entry fetched");
        self.entries.insert(
            id,
            Cached {
                twin: Arc::clone(&twin),
                fetched_at: Instant::now(),
            },
        );
        Ok(twin)
    }

    /// Resolves an account key to a twin id. Never cached.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::UnknownKey`] if no twin owns the key.
    pub async fn get_by_pubkey(&self, pubkey: &[u8]) -> Result<TwinId, DirectoryError> {
        self.provider.get_twin_by_pubkey(pubkey).await
    }

    /// Publishes the caller's relay record and E2E key, then drops the
    /// cached copy of `own` so the next lookup sees the new record.
    ///
    /// # Errors
    ///
    /// Returns the provider failure.
    pub async fn publish(
        &self,
        own: TwinId,
        signer: &Signer,
        relay: &str,
        e2e_key: &[u8],
    ) -> Result<(), DirectoryError> {
        self.provider.update_twin(signer, relay, e2e_key).await?;
        self.invalidate(own);
        Ok(())
    }

    /// Drops the cached entry for `id`.
    pub fn invalidate(&self, id: TwinId) {
        self.entries.remove(&id);
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Inner {
    twins: HashMap<TwinId, Twin>,
    by_account: HashMap<Vec<u8>, TwinId>,
    next_id: TwinId,
    updates: usize,
    lookups: usize,
}

/// In-process directory with monotonically assigned twin ids.
///
/// Uses `std::sync::RwLock`; no lock is held across an await.
pub struct MemoryDirectory {
    inner: RwLock<Inner>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                twins: HashMap::new(),
                by_account: HashMap::new(),
                next_id: 1,
                updates: 0,
                lookups: 0,
            }),
        }
    }
}

impl MemoryDirectory {
    /// Empty directory; the first registered twin gets id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new twin for `account` and returns its id.
    ///
    /// Registering an already known account returns the existing id.
    pub fn register(
        &self,
        account: &[u8],
        relay: Option<String>,
        e2e_key: Option<Vec<u8>>,
    ) -> TwinId {
        let mut inner = self.write();
        if let Some(id) = inner.by_account.get(account) {
            return *id;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_account.insert(account.to_vec(), id);
        inner.twins.insert(
            id,
            Twin {
                id,
                account: account.to_vec(),
                relay,
                e2e_key,
            },
        );
        id
    }

    /// Snapshot of a record, bypassing any cache.
    #[must_use]
    pub fn twin(&self, id: TwinId) -> Option<Twin> {
        self.read().twins.get(&id).cloned()
    }

    /// Number of successful `update_twin` calls so far.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.read().updates
    }

    /// Number of `get_twin` calls served so far.
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.read().lookups
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl DirectoryProvider for MemoryDirectory {
    async fn get_twin(&self, id: TwinId) -> Result<Twin, DirectoryError> {
        let mut inner = self.write();
        inner.lookups += 1;
        inner
            .twins
            .get(&id)
            .cloned()
            .ok_or(DirectoryError::NotFound(id))
    }

    async fn get_twin_by_pubkey(&self, pubkey: &[u8]) -> Result<TwinId, DirectoryError> {
        self.read()
            .by_account
            .get(pubkey)
            .copied()
            .ok_or(DirectoryError::UnknownKey)
    }

    async fn update_twin(
        &self,
        signer: &Signer,
        relay: &str,
        e2e_key: &[u8],
    ) -> Result<(), DirectoryError> {
        let account = signer.public_key();
        let mut inner = self.write();
        let id = *inner
            .by_account
            .get(account.as_slice())
            .ok_or(DirectoryError::UnknownKey)?;
        let twin = inner.twins.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        twin.relay = Some(relay.to_string());
        twin.e2e_key = Some(e2e_key.to_vec());
        inner.updates += 1;
        Ok(())
    }
}
