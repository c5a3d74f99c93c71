//! Store that persists nothing.
//!
//! Used when persistence is turned off: writes succeed and are dropped,
//! reads always miss. Entities still live in broker reference tables while
//! reachable.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use super::{Direction, Store, StoreKey, StoreProvider};
use crate::Result;
use crate::traits::{EntityId, Model};

/// A store that never holds anything.
pub struct DisabledStore<I, M> {
    name: String,
    _marker: PhantomData<fn() -> (I, M)>,
}

impl<I, M> DisabledStore<I, M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, M> Store<I, M> for DisabledStore<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, _id: &I) -> Result<Option<M>> {
        Ok(None)
    }

    fn get_all(&self) -> BoxStream<'static, Result<M>> {
        stream::empty().boxed()
    }

    fn get_all_ids(&self) -> BoxStream<'static, Result<I>> {
        stream::empty().boxed()
    }

    fn query(
        &self,
        _from: I,
        _to: Option<I>,
        _direction: Direction,
        _limit: Option<usize>,
    ) -> BoxStream<'static, Result<M>> {
        stream::empty().boxed()
    }

    async fn add_or_update(&self, _model: M) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: &I) -> Result<bool> {
        Ok(false)
    }
}

/// Provider for [`DisabledStore`]s.
pub struct DisabledStoreProvider<I, M> {
    _marker: PhantomData<fn() -> (I, M)>,
}

impl<I, M> DisabledStoreProvider<I, M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<I, M> Default for DisabledStoreProvider<I, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<I, M> StoreProvider<I, M> for DisabledStoreProvider<I, M>
where
    I: EntityId,
    M: Model<Id = I>,
{
    async fn open(&self, key: &StoreKey) -> Result<Arc<dyn Store<I, M>>> {
        Ok(Arc::new(DisabledStore::new(key.to_string())))
    }
}
