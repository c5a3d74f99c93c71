//! Static description of the stores behind an entity type.

use std::collections::HashMap;

use super::{StoreKey, StoreType};
use crate::path::{CachePath, Scope};
use crate::traits::{CacheableEntity, ModelKind};
use crate::{MuninnError, Result};

type ScopeFn = fn(&CachePath) -> Result<Scope>;

fn scope_from_path<P: CacheableEntity + ?Sized>(path: &CachePath) -> Result<Scope> {
    path.scope_of::<P>()
}

/// One store in a hierarchy: a type token, optionally scoped by an ancestor.
#[derive(Clone, Copy)]
pub struct StoreSpec {
    store_type: StoreType,
    scope: Option<ScopeFn>,
}

impl StoreSpec {
    /// A single store shared by every instance (e.g. all users).
    pub fn global(store_type: StoreType) -> Self {
        Self {
            store_type,
            scope: None,
        }
    }

    /// One store per ancestor of type `P`, located through the cache path
    /// (e.g. the channel store of each guild).
    pub fn scoped<P: CacheableEntity + ?Sized>(store_type: StoreType) -> Self {
        Self {
            store_type,
            scope: Some(scope_from_path::<P>),
        }
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn key(&self, path: &CachePath) -> Result<StoreKey> {
        match self.scope {
            Some(scope) => Ok(StoreKey::scoped(self.store_type, scope(path)?)),
            None => Ok(StoreKey::global(self.store_type)),
        }
    }
}

/// The stores that may hold an entity type's models.
///
/// Models whose kind has no dedicated entry live in the root store.
#[derive(Clone)]
pub struct StoreHierarchy {
    root: StoreSpec,
    children: Vec<(ModelKind, StoreSpec)>,
}

impl StoreHierarchy {
    pub fn new(root: StoreSpec) -> Self {
        Self {
            root,
            children: Vec::new(),
        }
    }

    /// Models of `kind` live in `spec` instead of the root store.
    pub fn with(mut self, kind: ModelKind, spec: StoreSpec) -> Self {
        self.children.push((kind, spec));
        self
    }

    pub fn root(&self) -> &StoreSpec {
        &self.root
    }

    /// Resolve every spec against `path`.
    ///
    /// Fails with [`MuninnError::AmbiguousOwner`] if a kind is listed twice.
    pub fn resolve(
        &self,
        entity: &'static str,
        path: &CachePath,
    ) -> Result<(StoreKey, HashMap<ModelKind, StoreKey>)> {
        let root = self.root.key(path)?;
        let mut by_kind = HashMap::with_capacity(self.children.len());
        for (kind, spec) in &self.children {
            let key = spec.key(path)?;
            if by_kind.insert(*kind, key).is_some() {
                return Err(MuninnError::AmbiguousOwner {
                    entity,
                    kind: kind.to_string(),
                });
            }
        }
        Ok((root, by_kind))
    }
}
