//! Model stores and their resolution.
//!
//! Stores hold models (never entities), keyed by id. They are supplied by an
//! external persistence layer through a [`StoreProvider`] and asked for by a
//! [`StoreKey`]: a [`StoreType`] token plus an optional parent [`Scope`]
//! (e.g. "the channel store of guild 42").
//!
//! - [`MemoryStore`] — moka-backed in-memory store, optionally bounded.
//! - [`DisabledStore`] — accepts writes and forgets them.
//! - [`StoreHierarchy`] — the static description of which stores may hold an
//!   entity type's models, per model kind.
//! - [`StoreResolver`] / [`StoreInfo`] — lazy, memoized resolution of a
//!   hierarchy into live stores, including the parallel fan-out read.

mod disabled;
mod hierarchy;
mod memory;
mod resolver;

pub use disabled::{DisabledStore, DisabledStoreProvider};
pub use hierarchy::{StoreHierarchy, StoreSpec};
pub use memory::{MemoryStore, MemoryStoreProvider};
pub use resolver::{StoreInfo, StoreResolver};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Deserialize;

use crate::Result;
use crate::path::Scope;

/// Token naming a kind of physical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreType(&'static str);

impl StoreType {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identity of one physical store: a type token plus an optional parent scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub store_type: StoreType,
    pub scope: Option<Scope>,
}

impl StoreKey {
    pub fn global(store_type: StoreType) -> Self {
        Self {
            store_type,
            scope: None,
        }
    }

    pub fn scoped(store_type: StoreType, scope: Scope) -> Self {
        Self {
            store_type,
            scope: Some(scope),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}@{}", self.store_type, scope),
            None => write!(f, "{}", self.store_type),
        }
    }
}

/// Ordering of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ids greater than or equal to `from`, ascending.
    #[default]
    After,
    /// Ids less than or equal to `from`, descending.
    Before,
}

/// Key-value store of models.
///
/// I/O failures are reported as errors and passed to the caller unchanged;
/// the cache applies no retry policy.
#[async_trait]
pub trait Store<I, M>: Send + Sync {
    /// Store name for logging/debugging.
    fn name(&self) -> &str;

    async fn get(&self, id: &I) -> Result<Option<M>>;

    fn get_all(&self) -> BoxStream<'static, Result<M>>;

    fn get_all_ids(&self) -> BoxStream<'static, Result<I>>;

    /// Models with ids between `from` (inclusive) and `to` (inclusive), in
    /// `direction` order, at most `limit` of them.
    fn query(
        &self,
        from: I,
        to: Option<I>,
        direction: Direction,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<M>>;

    async fn add_or_update(&self, model: M) -> Result<()>;

    /// Batch write. Default implementation writes sequentially.
    async fn add_or_update_batch(&self, models: Vec<M>) -> Result<()>
    where
        M: Send + 'static,
    {
        for model in models {
            self.add_or_update(model).await?;
        }
        Ok(())
    }

    /// Remove a model, returning whether it was present.
    async fn remove(&self, id: &I) -> Result<bool>;
}

/// Source of physical stores for one model type.
#[async_trait]
pub trait StoreProvider<I, M>: Send + Sync {
    /// Open (or create) the store identified by `key`.
    async fn open(&self, key: &StoreKey) -> Result<Arc<dyn Store<I, M>>>;
}

/// Which provider serves model types without an explicitly registered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Disabled,
}
