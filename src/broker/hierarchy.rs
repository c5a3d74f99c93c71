//! Broker routing between a base entity type and its sub-types.
//!
//! A base broker (e.g. for `dyn Channel`) may hand some model kinds to
//! sub-brokers for concrete types (e.g. category channels). The routes are
//! declared statically through [`BrokerHierarchy`] and bound to live
//! sub-brokers the first time the base broker needs them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{EntityBroker, EntityHandle};
use crate::path::CachePath;
use crate::sync::KeyedGuard;
use crate::state::StateController;
use crate::traits::{CacheableEntity, ModelKind};
use crate::{MuninnError, Result};

/// The side of a sub-broker a base broker talks to.
#[async_trait]
pub(crate) trait BrokerRoute<E: CacheableEntity + ?Sized>: Send + Sync {
    fn entity(&self) -> &'static str;

    /// Construct (or find) the entity in the sub-broker.
    async fn construct(&self, model: E::Model, path: &CachePath) -> Result<EntityHandle<E>>;

    fn live_handle(&self, id: &E::Id) -> Option<EntityHandle<E>>;

    fn update_in_reference(&self, model: &E::Model) -> Result<bool>;

    /// The sub-broker's lock for `id`, or its own sub-broker's for `kind`.
    async fn lock(&self, kind: ModelKind, id: E::Id) -> Result<KeyedGuard<E::Id>>;

    /// Merge or construct while the caller holds [`lock`](Self::lock).
    fn merge_or_construct_locked(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>>;

    async fn create_latent(&self, model: E::Model, path: &CachePath) -> Result<Arc<E>>;

    fn owns_handle(&self, handle: &EntityHandle<E>) -> bool;
}

struct SubBroker<S: CacheableEntity + ?Sized, E: ?Sized> {
    broker: EntityBroker<S>,
    upcast: fn(Arc<S>) -> Arc<E>,
}

#[async_trait]
impl<S, E> BrokerRoute<E> for SubBroker<S, E>
where
    S: CacheableEntity + ?Sized,
    E: CacheableEntity<Id = S::Id, Model = S::Model> + ?Sized,
{
    fn entity(&self) -> &'static str {
        S::NAME
    }

    async fn construct(&self, model: E::Model, path: &CachePath) -> Result<EntityHandle<E>> {
        let handle = self.broker.accept_transfer(model, path).await?;
        Ok(handle.map(self.upcast))
    }

    fn live_handle(&self, id: &E::Id) -> Option<EntityHandle<E>> {
        self.broker
            .own_live_handle(id)
            .map(|handle| handle.map(self.upcast))
    }

    fn update_in_reference(&self, model: &E::Model) -> Result<bool> {
        self.broker.update_in_reference(model)
    }

    async fn lock(&self, kind: ModelKind, id: E::Id) -> Result<KeyedGuard<E::Id>> {
        self.broker.lock_owner(kind, id).await
    }

    fn merge_or_construct_locked(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>> {
        let handle = self.broker.merge_or_construct_locked(model, path)?;
        Ok(handle.map(self.upcast))
    }

    async fn create_latent(&self, model: E::Model, path: &CachePath) -> Result<Arc<E>> {
        let entity = self.broker.create_latent(model, path, None).await?;
        Ok((self.upcast)(entity))
    }

    fn owns_handle(&self, handle: &EntityHandle<E>) -> bool {
        self.broker.owns_handle(handle)
    }
}

type BindFn<E> = Arc<dyn Fn(&StateController) -> Result<Arc<dyn BrokerRoute<E>>> + Send + Sync>;

struct RouteSpec<E: CacheableEntity + ?Sized> {
    kinds: Vec<ModelKind>,
    entity: &'static str,
    bind: BindFn<E>,
}

/// A route bound to a live sub-broker.
pub(crate) struct ResolvedRoute<E: CacheableEntity + ?Sized> {
    pub(crate) kinds: Vec<ModelKind>,
    pub(crate) target: Arc<dyn BrokerRoute<E>>,
}

/// Which sub-broker owns which model kinds of an entity type.
///
/// ```rust,ignore
/// fn broker_hierarchy() -> BrokerHierarchy<dyn Channel> {
///     BrokerHierarchy::new().route::<CategoryChannel>(&[CATEGORY], |c| c as Arc<dyn Channel>)
/// }
/// ```
pub struct BrokerHierarchy<E: CacheableEntity + ?Sized> {
    routes: Vec<RouteSpec<E>>,
}

impl<E: CacheableEntity + ?Sized> BrokerHierarchy<E> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Route models of `kinds` to the broker for `S`.
    ///
    /// `upcast` turns a sub-type entity into the base type; it must return
    /// the same object.
    pub fn route<S>(mut self, kinds: &[ModelKind], upcast: fn(Arc<S>) -> Arc<E>) -> Self
    where
        S: CacheableEntity<Id = E::Id, Model = E::Model> + ?Sized,
    {
        let bind: BindFn<E> = Arc::new(move |controller: &StateController| {
            let broker = controller.broker::<S>()?;
            Ok(Arc::new(SubBroker { broker, upcast }) as Arc<dyn BrokerRoute<E>>)
        });
        self.routes.push(RouteSpec {
            kinds: kinds.to_vec(),
            entity: S::NAME,
            bind,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Name of the sub-broker entity owning `kind`, if any.
    pub fn owner_of(&self, kind: ModelKind) -> Option<&'static str> {
        self.routes
            .iter()
            .find(|route| route.kinds.contains(&kind))
            .map(|route| route.entity)
    }

    /// Every routed kind must have exactly one owner.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            for kind in &route.kinds {
                if !seen.insert(*kind) {
                    return Err(MuninnError::AmbiguousOwner {
                        entity: E::NAME,
                        kind: kind.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn bind(&self, controller: &StateController) -> Result<Vec<ResolvedRoute<E>>> {
        self.routes
            .iter()
            .map(|route| {
                Ok(ResolvedRoute {
                    kinds: route.kinds.clone(),
                    target: (route.bind)(controller)?,
                })
            })
            .collect()
    }
}

impl<E: CacheableEntity + ?Sized> Default for BrokerHierarchy<E> {
    fn default() -> Self {
        Self::new()
    }
}
