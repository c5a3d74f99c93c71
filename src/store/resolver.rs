//! Lazy, memoized store resolution.
//!
//! [`StoreResolver`] opens physical stores through a [`StoreProvider`] at
//! most once per [`StoreKey`]: the memo table is checked, then the key's lock
//! in a [`KeyedMutex`] is taken, then the memo is checked again before the
//! provider is asked. Unrelated keys resolve concurrently.
//!
//! [`StoreInfo`] is the view of one entity type's [`StoreHierarchy`] under a
//! particular cache path: a root store, a kind-to-store map, and the
//! distinct set of all stores.
//!
//! # Fan-out reads
//!
//! With more than one store in the hierarchy, [`StoreInfo::get`] reads all of
//! them concurrently and takes the first non-empty answer. The remaining
//! reads are dropped, which cancels them at their next suspension point. No
//! ordering exists between stores; whichever answers first wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{Store, StoreHierarchy, StoreKey, StoreProvider};
use crate::Result;
use crate::path::CachePath;
use crate::sync::KeyedMutex;
use crate::telemetry;
use crate::traits::{EntityId, Model, ModelKind};

/// Memoizing front for a [`StoreProvider`].
pub struct StoreResolver<I, M> {
    provider: Arc<dyn StoreProvider<I, M>>,
    stores: RwLock<HashMap<StoreKey, Arc<dyn Store<I, M>>>>,
    locks: KeyedMutex<StoreKey>,
    opened: AtomicUsize,
}

impl<I, M> StoreResolver<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    pub fn new(provider: Arc<dyn StoreProvider<I, M>>) -> Self {
        Self {
            provider,
            stores: RwLock::new(HashMap::new()),
            locks: KeyedMutex::new(),
            opened: AtomicUsize::new(0),
        }
    }

    /// The store for `key`, opening it on first use.
    pub async fn get_or_compute(&self, key: &StoreKey) -> Result<Arc<dyn Store<I, M>>> {
        if let Some(store) = self.stores.read().get(key) {
            return Ok(Arc::clone(store));
        }

        let _guard = self.locks.acquire(key.clone()).await;

        if let Some(store) = self.stores.read().get(key) {
            return Ok(Arc::clone(store));
        }

        let store = self.provider.open(key).await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(store = %key, "opened store");
        self.stores.write().insert(key.clone(), Arc::clone(&store));
        Ok(store)
    }

    /// Number of times the provider was asked to open a store.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Resolve `hierarchy` under `path` for the entity type named `entity`.
    pub fn info(
        self: &Arc<Self>,
        entity: &'static str,
        hierarchy: &StoreHierarchy,
        path: &CachePath,
    ) -> Result<StoreInfo<I, M>> {
        let (root, by_kind) = hierarchy.resolve(entity, path)?;
        Ok(StoreInfo {
            entity,
            resolver: Arc::clone(self),
            root,
            by_kind,
        })
    }
}

/// One entity type's stores under one cache path.
pub struct StoreInfo<I, M> {
    entity: &'static str,
    resolver: Arc<StoreResolver<I, M>>,
    root: StoreKey,
    by_kind: HashMap<ModelKind, StoreKey>,
}

impl<I, M> StoreInfo<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    /// The primary store.
    pub async fn store(&self) -> Result<Arc<dyn Store<I, M>>> {
        self.resolver.get_or_compute(&self.root).await
    }

    /// Key of the store holding models of `kind`.
    pub fn key_for(&self, kind: ModelKind) -> &StoreKey {
        self.by_kind.get(&kind).unwrap_or(&self.root)
    }

    /// The store holding models of `kind`.
    pub async fn store_for(&self, kind: ModelKind) -> Result<Arc<dyn Store<I, M>>> {
        self.resolver.get_or_compute(self.key_for(kind)).await
    }

    /// Distinct store keys, root first.
    pub fn keys(&self) -> Vec<StoreKey> {
        let mut keys = vec![self.root.clone()];
        for key in self.by_kind.values() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Whether every kind lives in the root store.
    pub fn is_flat(&self) -> bool {
        self.by_kind.values().all(|key| key == &self.root)
    }

    /// Every distinct store, root first.
    pub async fn stores(&self) -> Result<Vec<Arc<dyn Store<I, M>>>> {
        let mut stores = Vec::new();
        for key in self.keys() {
            stores.push(self.resolver.get_or_compute(&key).await?);
        }
        Ok(stores)
    }

    /// Read `id` from the hierarchy.
    ///
    /// A flat hierarchy is a single read. Otherwise all stores are read
    /// concurrently; the first hit wins and the other reads are cancelled.
    /// The first store error aborts the read and is returned as-is.
    pub async fn get(&self, id: &I) -> Result<Option<M>> {
        if self.is_flat() {
            return self.store().await?.get(id).await;
        }

        let stores = self.stores().await?;
        let mut reads: FuturesUnordered<_> = stores
            .into_iter()
            .map(|store| {
                let id = id.clone();
                async move { store.get(&id).await }
            })
            .collect();

        while let Some(result) = reads.next().await {
            if let Some(model) = result? {
                let cancelled = reads.len();
                drop(reads);
                if cancelled > 0 {
                    metrics::counter!(telemetry::STORE_READS_CANCELLED_TOTAL, "entity" => self.entity)
                        .increment(cancelled as u64);
                }
                trace!(entity = self.entity, %id, cancelled, "fan-out read hit");
                return Ok(Some(model));
            }
        }

        Ok(None)
    }
}
