//! In-memory model store.
//!
//! Backed by a moka cache so a store can be bounded: with a capacity set,
//! the least recently used models are evicted once it is reached. Eviction
//! only drops persisted models; live entities are tracked by brokers and are
//! unaffected.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use moka::sync::Cache;
use parking_lot::Mutex;

use super::{Direction, Store, StoreKey, StoreProvider};
use crate::Result;
use crate::traits::{EntityId, Model};

/// Thread-safe in-memory store keyed on model id.
pub struct MemoryStore<I, M> {
    name: String,
    models: Cache<I, M>,
}

impl<I, M> MemoryStore<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    /// Create an unbounded store.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, None)
    }

    /// Create a store holding at most `max_models` models (`None` = unbounded).
    pub fn with_capacity(name: impl Into<String>, max_models: Option<u64>) -> Self {
        let builder = Cache::builder();
        let models = match max_models {
            Some(max) => builder.max_capacity(max).build(),
            None => builder.build(),
        };
        Self {
            name: name.into(),
            models,
        }
    }

    /// Number of models currently held.
    pub fn len(&self) -> u64 {
        self.models.run_pending_tasks();
        self.models.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<M> {
        self.models.iter().map(|(_, model)| model).collect()
    }
}

#[async_trait]
impl<I, M> Store<I, M> for MemoryStore<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &I) -> Result<Option<M>> {
        Ok(self.models.get(id))
    }

    fn get_all(&self) -> BoxStream<'static, Result<M>> {
        stream::iter(self.snapshot().into_iter().map(Ok)).boxed()
    }

    fn get_all_ids(&self) -> BoxStream<'static, Result<I>> {
        let ids: Vec<I> = self.models.iter().map(|(id, _)| I::clone(&id)).collect();
        stream::iter(ids.into_iter().map(Ok)).boxed()
    }

    fn query(
        &self,
        from: I,
        to: Option<I>,
        direction: Direction,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<M>> {
        let mut matched: Vec<M> = self
            .snapshot()
            .into_iter()
            .filter(|model| {
                let id = model.id();
                match direction {
                    Direction::After => id >= from && to.as_ref().is_none_or(|to| &id <= to),
                    Direction::Before => id <= from && to.as_ref().is_none_or(|to| &id >= to),
                }
            })
            .collect();

        matched.sort_by_key(|model| model.id());
        if direction == Direction::Before {
            matched.reverse();
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }

        stream::iter(matched.into_iter().map(Ok)).boxed()
    }

    async fn add_or_update(&self, model: M) -> Result<()> {
        self.models.insert(model.id(), model);
        Ok(())
    }

    async fn add_or_update_batch(&self, models: Vec<M>) -> Result<()>
    where
        M: Send + 'static,
    {
        for model in models {
            self.models.insert(model.id(), model);
        }
        Ok(())
    }

    async fn remove(&self, id: &I) -> Result<bool> {
        Ok(self.models.remove(id).is_some())
    }
}

/// Provider handing out one [`MemoryStore`] per [`StoreKey`].
pub struct MemoryStoreProvider<I, M> {
    stores: Mutex<HashMap<StoreKey, Arc<MemoryStore<I, M>>>>,
    max_models: Option<u64>,
    _marker: PhantomData<fn() -> (I, M)>,
}

impl<I, M> MemoryStoreProvider<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    pub fn new(max_models: Option<u64>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            max_models,
            _marker: PhantomData,
        }
    }

    /// The store for `key`, if it has been opened.
    pub fn existing(&self, key: &StoreKey) -> Option<Arc<MemoryStore<I, M>>> {
        self.stores.lock().get(key).cloned()
    }

    /// Number of stores opened so far.
    pub fn store_count(&self) -> usize {
        self.stores.lock().len()
    }
}

impl<I, M> Default for MemoryStoreProvider<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl<I, M> StoreProvider<I, M> for MemoryStoreProvider<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    async fn open(&self, key: &StoreKey) -> Result<Arc<dyn Store<I, M>>> {
        let mut stores = self.stores.lock();
        let store = stores
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MemoryStore::with_capacity(key.to_string(), self.max_models)));
        Ok(Arc::clone(store) as Arc<dyn Store<I, M>>)
    }
}
