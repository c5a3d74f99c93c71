//! Cache paths: ancestor identities threaded through construction.
//!
//! A [`CachePath`] records, per entity type, the id of an ancestor the
//! current operation is scoped to (e.g. the guild a channel belongs to).
//! Brokers use it to locate parent-scoped stores; entities use it during
//! construction. Paths carry ids only and are built fresh per top-level
//! operation.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use muninn::{CachePath, CacheableEntity, ConstructionContext, ModelKind, Model, Result};
//! # use muninn::store::{StoreHierarchy, StoreSpec, StoreType};
//! # #[derive(Clone)] struct GuildModel { id: u64 }
//! # impl Model for GuildModel {
//! #     type Id = u64;
//! #     fn id(&self) -> u64 { self.id }
//! #     fn kind(&self) -> ModelKind { ModelKind::new("guild") }
//! # }
//! # struct Guild;
//! # impl CacheableEntity for Guild {
//! #     type Id = u64; type Model = GuildModel; type Actor = ();
//! #     const NAME: &'static str = "Guild";
//! #     fn construct(_: &ConstructionContext<'_, ()>, _: &GuildModel) -> Result<Arc<Self>> { Ok(Arc::new(Guild)) }
//! #     fn to_model(&self) -> GuildModel { GuildModel { id: 0 } }
//! #     fn update(&self, _: &GuildModel) -> Result<()> { Ok(()) }
//! #     fn store_hierarchy() -> StoreHierarchy { StoreHierarchy::new(StoreSpec::global(StoreType::new("guilds"))) }
//! # }
//! let mut path = CachePath::new();
//! path.push::<Guild>(42)?;
//! assert_eq!(path.require::<Guild>()?, 42);
//! assert!(path.push::<Guild>(43).is_err());
//! # Ok::<(), muninn::MuninnError>(())
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::traits::CacheableEntity;
use crate::{MuninnError, Result};

#[derive(Clone)]
struct PathEntry {
    entity: &'static str,
    id: Arc<dyn Any + Send + Sync>,
    scope: Scope,
}

/// Insertion-ordered mapping from entity type to ancestor id.
#[derive(Clone, Default)]
pub struct CachePath {
    entries: IndexMap<TypeId, PathEntry>,
}

impl CachePath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as the ancestor of type `E`.
    ///
    /// Fails with [`MuninnError::DuplicatePathEntry`] if the path already
    /// has an entry for `E`.
    pub fn push<E: CacheableEntity + ?Sized>(&mut self, id: E::Id) -> Result<()> {
        let key = TypeId::of::<E>();
        if self.entries.contains_key(&key) {
            return Err(MuninnError::DuplicatePathEntry { entity: E::NAME });
        }
        let scope = Scope::of::<E>(&id);
        self.entries.insert(
            key,
            PathEntry {
                entity: E::NAME,
                id: Arc::new(id),
                scope,
            },
        );
        Ok(())
    }

    /// Builder-style [`push`](Self::push).
    pub fn with<E: CacheableEntity + ?Sized>(mut self, id: E::Id) -> Result<Self> {
        self.push::<E>(id)?;
        Ok(self)
    }

    /// The ancestor id of type `E`, failing with
    /// [`MuninnError::MissingPathEntry`] if absent.
    pub fn require<E: CacheableEntity + ?Sized>(&self) -> Result<E::Id> {
        self.try_get::<E>()
            .ok_or(MuninnError::MissingPathEntry { entity: E::NAME })
    }

    /// The ancestor id of type `E`, if present.
    pub fn try_get<E: CacheableEntity + ?Sized>(&self) -> Option<E::Id> {
        self.entries
            .get(&TypeId::of::<E>())
            .and_then(|entry| entry.id.downcast_ref::<E::Id>())
            .cloned()
    }

    /// Whether the path holds exactly `id` for `E`.
    pub fn contains<E: CacheableEntity + ?Sized>(&self, id: &E::Id) -> bool {
        self.try_get::<E>().is_some_and(|existing| &existing == id)
    }

    pub(crate) fn scope_of<E: CacheableEntity + ?Sized>(&self) -> Result<Scope> {
        self.entries
            .get(&TypeId::of::<E>())
            .map(|entry| entry.scope.clone())
            .ok_or(MuninnError::MissingPathEntry { entity: E::NAME })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entity names in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.values().map(|entry| entry.entity)
    }
}

impl fmt::Debug for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|entry| &entry.scope))
            .finish()
    }
}

/// Printable identity of an ancestor, used to key parent-scoped stores.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Scope(Arc<str>);

impl Scope {
    pub fn of<E: CacheableEntity + ?Sized>(id: &E::Id) -> Self {
        Self(Arc::from(format!("{}:{}", E::NAME, id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
