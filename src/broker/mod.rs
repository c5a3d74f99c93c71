//! Entity brokers.
//!
//! One [`EntityBroker`] exists per entity type and state controller. It
//! guarantees that at most one live entity object exists per id: lookups go
//! through a reference table of [`EntityReference`]s, and anything that may
//! construct an entity runs under the id's lock from a [`KeyedMutex`] with
//! a double check of the table.
//!
//! Brokers for base types route model kinds they do not construct
//! themselves to sub-brokers declared in the entity's [`BrokerHierarchy`].
//! A routed entity is constructed and tracked by the sub-broker only; the
//! base broker hands out handles upcast to the base type.
//!
//! Stores hold models, never entities. Plain creation does not persist;
//! updates write through to the store that owns the model's kind.

mod hierarchy;
mod reference;

pub use hierarchy::BrokerHierarchy;
pub use reference::{EntityHandle, EntityReference};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, trace, warn};

use self::hierarchy::{BrokerRoute, ResolvedRoute};
use self::reference::ReclaimFn;
use crate::context::{ClientHandle, ConstructionContext};
use crate::path::CachePath;
use crate::state::operation::{Operation, OperationQueue};
use crate::state::{ControllerInner, StateController};
use crate::store::{Direction, StoreHierarchy, StoreInfo, StoreResolver};
use crate::sync::{KeyedGuard, KeyedMutex};
use crate::telemetry;
use crate::traits::{CacheableEntity, Model, ModelKind, PartialModel};
use crate::{MuninnError, Result};

/// Outcome of [`EntityBroker::try_create_latent_handle`].
pub enum LatentSlot<E: CacheableEntity + ?Sized> {
    /// A live entity already exists for the id.
    Hit(Arc<E>),
    /// No live entity; the caller holds the id's lock.
    Miss(KeyedGuard<E::Id>),
    /// The id's lock is held by someone else.
    ///
    /// [`EntityBroker::create_latent`] then waits for the lock, for at most
    /// `lock_timeout_ms` when one is configured, and checks the table again.
    Contended,
}

impl<E: CacheableEntity + ?Sized> fmt::Debug for LatentSlot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatentSlot::Hit(_) => f.write_str("Hit"),
            LatentSlot::Miss(guard) => f.debug_tuple("Miss").field(guard).finish(),
            LatentSlot::Contended => f.write_str("Contended"),
        }
    }
}

pub(crate) struct BrokerShared<E: CacheableEntity + ?Sized> {
    controller: Weak<ControllerInner>,
    client: ClientHandle,
    references: Mutex<HashMap<E::Id, Arc<EntityReference<E>>>>,
    locks: KeyedMutex<E::Id>,
    resolver: Arc<StoreResolver<E::Id, E::Model>>,
    store_hierarchy: StoreHierarchy,
    hierarchy: BrokerHierarchy<E>,
    routes: OnceLock<Vec<ResolvedRoute<E>>>,
    reclaim: ReclaimFn<E::Id>,
    queue: OperationQueue,
    lock_timeout: Option<Duration>,
    stream_buffer: usize,
    /// Ids whose latent entity waits on the queue for attachment. The id's
    /// lock is held until the attach operation has run.
    pending_attaches: Mutex<HashSet<E::Id>>,
    attach_pending: Notify,
}

impl<E: CacheableEntity + ?Sized> BrokerShared<E> {
    /// Remove `id` from the table if its reference is dead.
    fn purge_dead(&self, id: &E::Id) -> bool {
        let removed = {
            let mut references = self.references.lock();
            match references.get(id) {
                Some(reference) if !reference.is_alive() => references.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(reference) => {
                reference.kill();
                metrics::counter!(telemetry::REFERENCES_RECLAIMED_TOTAL, "entity" => E::NAME)
                    .increment(1);
                trace!(entity = E::NAME, %id, "purged dead reference");
                true
            }
            None => false,
        }
    }

    /// Remove every dead reference, returning how many were removed.
    pub(crate) fn sweep(&self) -> usize {
        let dead: Vec<Arc<EntityReference<E>>> = {
            let mut references = self.references.lock();
            let ids: Vec<E::Id> = references
                .iter()
                .filter(|(_, reference)| !reference.is_alive())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| references.remove(id)).collect()
        };
        for reference in &dead {
            reference.kill();
        }
        if !dead.is_empty() {
            metrics::counter!(telemetry::REFERENCES_RECLAIMED_TOTAL, "entity" => E::NAME)
                .increment(dead.len() as u64);
            debug!(entity = E::NAME, reclaimed = dead.len(), "swept dead references");
        }
        dead.len()
    }
}

fn reclaimer<E: CacheableEntity + ?Sized>(
    broker: Weak<BrokerShared<E>>,
    queue: OperationQueue,
) -> ReclaimFn<E::Id> {
    Arc::new(move |id: &E::Id| {
        let broker = broker.clone();
        let id = id.clone();
        let name = format!("reclaim {} {}", E::NAME, id);
        let task = async move {
            if let Some(shared) = broker.upgrade() {
                shared.purge_dead(&id);
            }
            Ok(())
        };
        if queue.enqueue(Operation::cleanup(name, Box::pin(task))).is_err() {
            trace!(entity = E::NAME, "operation queue closed, reclamation left to sweep");
        }
    })
}

/// Identity-preserving cache front for one entity type.
///
/// Cheap to clone; clones share the same table and locks.
pub struct EntityBroker<E: CacheableEntity + ?Sized> {
    shared: Arc<BrokerShared<E>>,
}

impl<E: CacheableEntity + ?Sized> Clone for EntityBroker<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: CacheableEntity + ?Sized> fmt::Debug for EntityBroker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityBroker")
            .field("entity", &E::NAME)
            .field("references", &self.reference_count())
            .finish()
    }
}

impl<E: CacheableEntity + ?Sized> EntityBroker<E> {
    pub(crate) fn new(controller: &Arc<ControllerInner>) -> Result<Self> {
        let hierarchy = E::broker_hierarchy();
        hierarchy.validate()?;
        let resolver = controller.resolver::<E::Id, E::Model>()?;
        let queue = controller.queue.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<BrokerShared<E>>| BrokerShared {
            controller: Arc::downgrade(controller),
            client: Arc::clone(&controller.client),
            references: Mutex::new(HashMap::new()),
            locks: KeyedMutex::new(),
            resolver,
            store_hierarchy: E::store_hierarchy(),
            hierarchy,
            routes: OnceLock::new(),
            reclaim: reclaimer(weak.clone(), queue.clone()),
            queue,
            lock_timeout: controller.config.lock_timeout(),
            stream_buffer: controller.config.stream_buffer,
            pending_attaches: Mutex::new(HashSet::new()),
            attach_pending: Notify::new(),
        });

        debug!(entity = E::NAME, "created broker");
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<BrokerShared<E>>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<BrokerShared<E>> {
        &self.shared
    }

    pub fn name(&self) -> &'static str {
        E::NAME
    }

    /// The stores of this entity type under `path`.
    pub fn store_info(&self, path: &CachePath) -> Result<StoreInfo<E::Id, E::Model>> {
        self.shared
            .resolver
            .info(E::NAME, &self.shared.store_hierarchy, path)
    }

    // ========================================================================
    // Reference table
    // ========================================================================

    /// A handle to the live entity for `id`, looking in sub-brokers too.
    pub fn live_handle(&self, id: &E::Id) -> Result<Option<EntityHandle<E>>> {
        if let Some(handle) = self.own_live_handle(id) {
            return Ok(Some(handle));
        }
        for route in self.routes()? {
            if let Some(handle) = route.target.live_handle(id) {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    /// A handle to the live entity for `id` in this broker's own table.
    ///
    /// A dead reference found on the way is purged.
    pub(crate) fn own_live_handle(&self, id: &E::Id) -> Option<EntityHandle<E>> {
        let reference = self.shared.references.lock().get(id).cloned()?;
        match reference.handle() {
            Some(handle) => Some(handle),
            None => {
                self.shared.purge_dead(id);
                None
            }
        }
    }

    fn own_live_entity(&self, id: &E::Id) -> Option<Arc<E>> {
        let reference = self.shared.references.lock().get(id).cloned()?;
        let entity = reference.try_get_entity();
        if entity.is_none() {
            self.shared.purge_dead(id);
        }
        entity
    }

    /// Whether this broker's table holds a live entity for `id`.
    pub fn is_cached(&self, id: &E::Id) -> bool {
        self.shared
            .references
            .lock()
            .get(id)
            .is_some_and(|reference| reference.is_alive())
    }

    /// Number of references in this broker's table, dead ones included.
    pub fn reference_count(&self) -> usize {
        self.shared.references.lock().len()
    }

    /// Outstanding handles for `id` in this broker's table.
    pub fn handle_count(&self, id: &E::Id) -> usize {
        self.shared
            .references
            .lock()
            .get(id)
            .map_or(0, |reference| reference.handle_count())
    }

    /// Purge references whose entities are no longer reachable.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Release `handle`, checking that it belongs to this broker.
    ///
    /// Fails with [`MuninnError::HandleNotOwned`] for a handle allocated by
    /// another broker or for an id this broker no longer tracks. The handle
    /// is released either way.
    pub fn release_handle(&self, handle: EntityHandle<E>) -> Result<()> {
        if self.owns_handle(&handle) {
            return Ok(());
        }
        for route in self.routes()? {
            if route.target.owns_handle(&handle) {
                return Ok(());
            }
        }
        Err(MuninnError::HandleNotOwned { entity: E::NAME })
    }

    pub(crate) fn owns_handle<U>(&self, handle: &EntityHandle<U>) -> bool
    where
        U: CacheableEntity<Id = E::Id> + ?Sized,
    {
        self.shared
            .references
            .lock()
            .get(handle.id())
            .is_some_and(|reference| reference.owns(handle))
    }

    fn insert_reference(&self, id: E::Id, entity: &Arc<E>) -> Arc<EntityReference<E>> {
        let reference = EntityReference::new(id.clone(), entity, Arc::clone(&self.shared.reclaim));
        let replaced = self
            .shared
            .references
            .lock()
            .insert(id, Arc::clone(&reference));
        if let Some(replaced) = replaced {
            replaced.kill();
        }
        reference
    }

    fn register(&self, id: E::Id, entity: &Arc<E>) -> Result<EntityHandle<E>> {
        let reference = self.insert_reference(id, entity);
        reference.allocate_handle(Some(entity))?.ok_or_else(|| {
            MuninnError::ownership(
                format!("a live {} {}", E::NAME, reference.id()),
                "an unreachable entity",
            )
        })
    }

    // ========================================================================
    // Construction
    // ========================================================================

    fn construct(
        &self,
        model: &E::Model,
        path: &CachePath,
        actor: Option<&Arc<E::Actor>>,
    ) -> Result<Arc<E>> {
        let context = ConstructionContext::new(&self.shared.client, path, actor);
        let entity = E::construct(&context, model)?;
        metrics::counter!(telemetry::CONSTRUCTIONS_TOTAL, "entity" => E::NAME).increment(1);
        debug!(entity = E::NAME, id = %model.id(), "constructed entity");
        Ok(entity)
    }

    async fn lock(&self, id: E::Id) -> Result<KeyedGuard<E::Id>> {
        self.shared
            .locks
            .acquire_within(id, self.shared.lock_timeout)
            .await
    }

    /// The id lock of the broker that constructs models of `kind`.
    pub(crate) async fn lock_owner(&self, kind: ModelKind, id: E::Id) -> Result<KeyedGuard<E::Id>> {
        match self.route_for(kind)? {
            Some(route) => route.lock(kind, id).await,
            None => self.lock(id).await,
        }
    }

    /// Owner locks for every distinct id in `models`, taken in id order.
    async fn lock_all(&self, models: &[E::Model]) -> Result<Vec<KeyedGuard<E::Id>>> {
        let mut keys: Vec<(E::Id, ModelKind)> =
            models.iter().map(|m| (m.id(), m.kind())).collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys.dedup_by(|a, b| a.0 == b.0);

        let mut guards = Vec::with_capacity(keys.len());
        for (id, kind) in keys {
            guards.push(self.lock_owner(kind, id).await?);
        }
        Ok(guards)
    }

    fn routes(&self) -> Result<&[ResolvedRoute<E>]> {
        if let Some(routes) = self.shared.routes.get() {
            return Ok(routes.as_slice());
        }
        if self.shared.hierarchy.is_empty() {
            return Ok(self.shared.routes.get_or_init(Vec::new).as_slice());
        }
        let controller = self.controller()?;
        let resolved = self.shared.hierarchy.bind(&controller)?;
        Ok(self.shared.routes.get_or_init(|| resolved).as_slice())
    }

    fn route_for(&self, kind: ModelKind) -> Result<Option<Arc<dyn BrokerRoute<E>>>> {
        Ok(self
            .routes()?
            .iter()
            .find(|route| route.kinds.contains(&kind))
            .map(|route| Arc::clone(&route.target)))
    }

    fn check_owns(&self, kind: ModelKind) -> Result<()> {
        if E::accepts(kind) {
            Ok(())
        } else {
            Err(MuninnError::NotOwned {
                broker: E::NAME,
                kind: kind.to_string(),
            })
        }
    }

    fn controller(&self) -> Result<StateController> {
        self.shared
            .controller
            .upgrade()
            .map(StateController::from_inner)
            .ok_or(MuninnError::Shutdown)
    }

    fn reconcile(&self, model: E::Model) -> E::Model {
        match self.shared.controller.upgrade() {
            Some(controller) => controller.self_models.reconcile(model),
            None => model,
        }
    }

    /// Create the entity for `model`, or return the live one.
    ///
    /// Kinds owned by a sub-broker are transferred to it. Nothing is
    /// persisted.
    #[instrument(skip_all, fields(entity = E::NAME, id = %model.id()))]
    pub async fn create(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<EntityHandle<E>> {
        let model = self.reconcile(model);
        if let Some(route) = self.route_for(model.kind())? {
            return self.transfer_to(route.as_ref(), model, path).await;
        }
        self.check_owns(model.kind())?;
        self.create_owned(model, path, actor.as_ref()).await
    }

    async fn create_owned(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<&Arc<E::Actor>>,
    ) -> Result<EntityHandle<E>> {
        let id = model.id();
        if let Some(handle) = self.own_live_handle(&id) {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "entity" => E::NAME).increment(1);
            return Ok(handle);
        }

        let _guard = self.lock(id.clone()).await?;
        if let Some(handle) = self.own_live_handle(&id) {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "entity" => E::NAME).increment(1);
            return Ok(handle);
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "entity" => E::NAME).increment(1);
        let entity = self.construct(&model, path, actor)?;
        self.register(id, &entity)
    }

    /// Route construction of a model this broker does not own to the
    /// sub-broker that does.
    pub async fn transfer_construction_of_entity(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>> {
        let kind = model.kind();
        let route = self.route_for(kind)?.ok_or_else(|| MuninnError::NotOwned {
            broker: E::NAME,
            kind: kind.to_string(),
        })?;
        self.transfer_to(route.as_ref(), model, path).await
    }

    async fn transfer_to(
        &self,
        route: &dyn BrokerRoute<E>,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>> {
        let id = model.id();
        trace!(entity = E::NAME, to = route.entity(), %id, "transferring construction");
        let handle = route.construct(model, path).await?;
        if handle.id() != &id {
            return Err(MuninnError::ownership(
                format!("{} {}", E::NAME, id),
                format!("{} {}", route.entity(), handle.id()),
            ));
        }
        Ok(handle)
    }

    /// Receive a model transferred from a base broker.
    pub(crate) async fn accept_transfer(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>> {
        if let Some(route) = self.route_for(model.kind())? {
            return self.transfer_to(route.as_ref(), model, path).await;
        }
        self.check_owns(model.kind())?;
        self.create_owned(model, path, None).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The entity for `id`: live if possible, otherwise constructed from the
    /// first store in the hierarchy that has the model.
    #[instrument(skip_all, fields(entity = E::NAME, %id))]
    pub async fn get(
        &self,
        path: &CachePath,
        id: E::Id,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<Option<EntityHandle<E>>> {
        if let Some(handle) = self.live_handle(&id)? {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "entity" => E::NAME).increment(1);
            return Ok(Some(handle));
        }

        let _guard = self.lock(id.clone()).await?;
        if let Some(handle) = self.live_handle(&id)? {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "entity" => E::NAME).increment(1);
            return Ok(Some(handle));
        }
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "entity" => E::NAME).increment(1);

        let info = self.store_info(path)?;
        let Some(model) = info.get(&id).await? else {
            return Ok(None);
        };
        if model.id() != id {
            return Err(MuninnError::ownership(
                format!("{} model {}", E::NAME, id),
                format!("model {}", model.id()),
            ));
        }
        let model = self.reconcile(model);
        self.upgrade_locked(model, path, actor.as_ref()).await.map(Some)
    }

    /// Construct from a stored model while holding this broker's id lock.
    async fn upgrade_locked(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<&Arc<E::Actor>>,
    ) -> Result<EntityHandle<E>> {
        if let Some(route) = self.route_for(model.kind())? {
            return self.transfer_to(route.as_ref(), model, path).await;
        }
        self.check_owns(model.kind())?;
        let entity = self.construct(&model, path, actor)?;
        self.register(model.id(), &entity)
    }

    /// Live handle or fresh construction for a model read from a store.
    async fn upgrade(&self, model: E::Model, path: &CachePath) -> Result<EntityHandle<E>> {
        let id = model.id();
        if let Some(handle) = self.live_handle(&id)? {
            return Ok(handle);
        }
        let _guard = self.lock(id.clone()).await?;
        if let Some(handle) = self.live_handle(&id)? {
            return Ok(handle);
        }
        let model = self.reconcile(model);
        self.upgrade_locked(model, path, None).await
    }

    /// Every entity in every store of the hierarchy.
    ///
    /// Entities are produced by a background task into a bounded channel;
    /// dropping the stream stops it.
    pub fn get_all(&self, path: &CachePath) -> BoxStream<'static, Result<EntityHandle<E>>> {
        let (tx, rx) = mpsc::channel(self.shared.stream_buffer);
        let broker = self.clone();
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.produce_all(&path, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn produce_all(
        &self,
        path: &CachePath,
        tx: &mpsc::Sender<Result<EntityHandle<E>>>,
    ) -> Result<()> {
        let info = self.store_info(path)?;
        for store in info.stores().await? {
            let mut models = store.get_all();
            while let Some(model) = models.next().await {
                let handle = self.upgrade(model?, path).await?;
                if tx.send(Ok(handle)).await.is_err() {
                    return Ok(()); // receiver dropped
                }
            }
        }
        Ok(())
    }

    /// Every id in every store of the hierarchy, without constructing.
    pub fn get_all_ids(&self, path: &CachePath) -> BoxStream<'static, Result<E::Id>> {
        let (tx, rx) = mpsc::channel(self.shared.stream_buffer);
        let info = self.store_info(path);
        tokio::spawn(async move {
            let result = async {
                let mut seen = HashSet::new();
                for store in info?.stores().await? {
                    let mut ids = store.get_all_ids();
                    while let Some(id) = ids.next().await {
                        let id = id?;
                        if seen.insert(id.clone()) && tx.send(Ok(id)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok::<(), MuninnError>(())
            }
            .await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    /// Entities with ids from `from` towards `to` in `direction`, at most
    /// `limit` of them, merged across the hierarchy's stores.
    pub fn query(
        &self,
        path: &CachePath,
        from: E::Id,
        to: Option<E::Id>,
        direction: Direction,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<EntityHandle<E>>> {
        let (tx, rx) = mpsc::channel(self.shared.stream_buffer);
        let broker = self.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let result = broker
                .produce_query(&path, from, to, direction, limit, &tx)
                .await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn produce_query(
        &self,
        path: &CachePath,
        from: E::Id,
        to: Option<E::Id>,
        direction: Direction,
        limit: Option<usize>,
        tx: &mpsc::Sender<Result<EntityHandle<E>>>,
    ) -> Result<()> {
        let info = self.store_info(path)?;
        let mut models: Vec<E::Model> = Vec::new();
        for store in info.stores().await? {
            let mut page = store.query(from.clone(), to.clone(), direction, limit);
            while let Some(model) = page.next().await {
                models.push(model?);
            }
        }

        models.sort_by_key(|model| model.id());
        if direction == Direction::Before {
            models.reverse();
        }
        models.dedup_by_key(|model| model.id());
        if let Some(limit) = limit {
            models.truncate(limit);
        }

        for model in models {
            let handle = self.upgrade(model, path).await?;
            if tx.send(Ok(handle)).await.is_err() {
                return Ok(()); // receiver dropped
            }
        }
        Ok(())
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Write `model` to the store owning its kind and merge it into the live
    /// entity, if any.
    ///
    /// Runs under the id lock of the broker owning the model's kind, so it
    /// is ordered with any construction of the same id.
    #[instrument(skip_all, fields(entity = E::NAME, id = %model.id()))]
    pub async fn update(&self, model: E::Model, path: &CachePath) -> Result<()> {
        let model = self.reconcile(model);
        let _guard = self.lock_owner(model.kind(), model.id()).await?;
        self.write_through(&model, path).await
    }

    async fn write_through(&self, model: &E::Model, path: &CachePath) -> Result<()> {
        let info = self.store_info(path)?;
        info.store_for(model.kind())
            .await?
            .add_or_update(model.clone())
            .await?;
        self.update_in_reference(model)?;
        Ok(())
    }

    /// [`update`](Self::update) as run by the operation queue.
    ///
    /// The worker must not wait on a lock held by an attach operation queued
    /// behind it. While an attach is pending for the id there is no live
    /// entity to race with, and the attach writes its own model afterwards,
    /// so the update is applied without the lock.
    async fn update_deferred(&self, model: E::Model, path: &CachePath) -> Result<()> {
        let id = model.id();
        let _guard = loop {
            let attach_pending = self.shared.attach_pending.notified();
            tokio::pin!(attach_pending);
            attach_pending.as_mut().enable();

            if self.shared.pending_attaches.lock().contains(&id) {
                trace!(entity = E::NAME, %id, "attach pending, updating without the id lock");
                break None;
            }
            tokio::select! {
                guard = self.lock(id.clone()) => break Some(guard?),
                _ = &mut attach_pending => {}
            }
        };
        self.write_through(&model, path).await
    }

    /// Merge `model` into the live entity for its id, here or in the
    /// sub-broker owning its kind. Returns whether an entity was live.
    pub fn update_in_reference(&self, model: &E::Model) -> Result<bool> {
        if let Some(route) = self.route_for(model.kind())? {
            return route.update_in_reference(model);
        }
        let id = model.id();
        let reference = self.shared.references.lock().get(&id).cloned();
        let Some(reference) = reference else {
            return Ok(false);
        };
        let merged = reference.merge(model)?;
        if !merged {
            self.shared.purge_dead(&id);
        }
        Ok(merged)
    }

    /// Apply a partial model onto the current model for its id.
    ///
    /// The base is the live entity's snapshot, or else the stored model.
    /// Returns whether anything was written. A partial without an id, or
    /// with no base to apply to, is skipped.
    #[instrument(skip_all, fields(entity = E::NAME))]
    pub async fn update_partial<P>(&self, partial: &P, path: &CachePath) -> Result<bool>
    where
        P: PartialModel<Model = E::Model>,
    {
        let Some(id) = partial.id() else {
            warn!(entity = E::NAME, "partial model has no id, skipping update");
            return Ok(false);
        };

        let _guard = self.lock(id.clone()).await?;
        let info = self.store_info(path)?;

        let live = match self.live_handle(&id)? {
            Some(handle) => Some(handle.to_model()),
            None => None,
        };
        let base = match live {
            Some(model) => Some(model),
            None => info.get(&id).await?,
        };
        let Some(mut model) = base else {
            debug!(entity = E::NAME, %id, "no base model for partial update");
            return Ok(false);
        };

        if !partial.apply_to(&mut model) {
            trace!(entity = E::NAME, %id, "partial update changed nothing");
            return Ok(false);
        }

        let model = self.reconcile(model);
        info.store_for(model.kind())
            .await?
            .add_or_update(model.clone())
            .await?;
        self.update_in_reference(&model)?;
        Ok(true)
    }

    /// Write `models` to their stores, one batch per kind, and merge each
    /// into its live entity.
    #[instrument(skip_all, fields(entity = E::NAME, count = models.len()))]
    pub async fn batch_update(&self, models: Vec<E::Model>, path: &CachePath) -> Result<()> {
        let info = self.store_info(path)?;
        let models: Vec<E::Model> = models.into_iter().map(|m| self.reconcile(m)).collect();
        let _guards = self.lock_all(&models).await?;

        for (kind, group) in group_by_kind(&models) {
            let batch = group.iter().map(|&i| models[i].clone()).collect();
            info.store_for(kind).await?.add_or_update_batch(batch).await?;
            for &i in &group {
                self.update_in_reference(&models[i])?;
            }
        }
        Ok(())
    }

    /// Create or merge an entity for each model, optionally persisting them
    /// first. Handles are returned in input order.
    #[instrument(skip_all, fields(entity = E::NAME, count = models.len(), persist = persist))]
    pub async fn batch_create_or_update(
        &self,
        models: Vec<E::Model>,
        path: &CachePath,
        persist: bool,
    ) -> Result<Vec<EntityHandle<E>>> {
        let models: Vec<E::Model> = models.into_iter().map(|m| self.reconcile(m)).collect();
        let info = if persist {
            Some(self.store_info(path)?)
        } else {
            None
        };
        let _guards = self.lock_all(&models).await?;

        let mut handles: Vec<Option<EntityHandle<E>>> = models.iter().map(|_| None).collect();
        for (kind, group) in group_by_kind(&models) {
            if let Some(info) = &info {
                let batch = group.iter().map(|&i| models[i].clone()).collect();
                info.store_for(kind).await?.add_or_update_batch(batch).await?;
            }
            for &i in &group {
                handles[i] = Some(self.merge_or_construct_locked(models[i].clone(), path)?);
            }
        }
        Ok(handles.into_iter().flatten().collect())
    }

    /// Merge into the live entity or construct one. The caller holds the
    /// owner lock for the model's id.
    pub(crate) fn merge_or_construct_locked(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<EntityHandle<E>> {
        if let Some(route) = self.route_for(model.kind())? {
            return route.merge_or_construct_locked(model, path);
        }
        self.check_owns(model.kind())?;

        let id = model.id();
        if let Some(handle) = self.own_live_handle(&id) {
            self.update_in_reference(&model)?;
            return Ok(handle);
        }
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "entity" => E::NAME).increment(1);
        let entity = self.construct(&model, path, None)?;
        self.register(id, &entity)
    }

    // ========================================================================
    // Latent entities
    // ========================================================================

    /// Non-blocking first step of latent creation.
    ///
    /// Returns the live entity, or the id's lock when there is none. The
    /// guard must be held until the latent entity is attached.
    pub fn try_create_latent_handle(&self, model: &E::Model) -> LatentSlot<E> {
        let id = model.id();
        if let Some(entity) = self.own_live_entity(&id) {
            return LatentSlot::Hit(entity);
        }
        match self.shared.locks.try_acquire(id.clone()) {
            Some(guard) => match self.own_live_entity(&id) {
                Some(entity) => LatentSlot::Hit(entity),
                None => LatentSlot::Miss(guard),
            },
            None => LatentSlot::Contended,
        }
    }

    /// Build an entity synchronously, without waiting for persistence.
    ///
    /// On a hit the live entity is returned and the model is merged into it
    /// on the operation queue. On a miss the entity is constructed now and
    /// attached (registered and persisted) on the operation queue; the id's
    /// lock is held until then, so no second entity can be constructed for
    /// the id in between.
    #[instrument(skip_all, fields(entity = E::NAME, id = %model.id()))]
    pub async fn create_latent(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<Arc<E>> {
        let model = self.reconcile(model);
        if let Some(route) = self.route_for(model.kind())? {
            return route.create_latent(model, path).await;
        }
        self.check_owns(model.kind())?;

        let guard = match self.try_create_latent_handle(&model) {
            LatentSlot::Hit(entity) => {
                self.enqueue_update(model, path)?;
                return Ok(entity);
            }
            LatentSlot::Miss(guard) => guard,
            LatentSlot::Contended => {
                let guard = self.lock(model.id()).await?;
                if let Some(entity) = self.own_live_entity(&model.id()) {
                    drop(guard);
                    self.enqueue_update(model, path)?;
                    return Ok(entity);
                }
                guard
            }
        };

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "entity" => E::NAME).increment(1);
        let entity = self.construct(&model, path, actor.as_ref())?;

        let id = model.id();
        let broker = self.clone();
        let name = format!("attach {} {}", E::NAME, id);
        let path = path.clone();
        let attached = Arc::clone(&entity);
        let pending = id.clone();
        let task = async move {
            let result = broker.attach_latent_entity(model, &path, attached).await;
            broker.shared.pending_attaches.lock().remove(&pending);
            result
        };

        self.shared.pending_attaches.lock().insert(id.clone());
        self.shared.attach_pending.notify_waiters();
        let enqueued = self
            .shared
            .queue
            .enqueue(Operation::attach_latent(name, Box::pin(task), guard));
        if let Err(e) = enqueued {
            self.shared.pending_attaches.lock().remove(&id);
            return Err(e);
        }

        Ok(entity)
    }

    async fn attach_latent_entity(
        &self,
        model: E::Model,
        path: &CachePath,
        entity: Arc<E>,
    ) -> Result<()> {
        // the caller already dropped the entity: nothing left to track
        if Arc::strong_count(&entity) > 1 {
            self.insert_reference(model.id(), &entity);
        } else {
            trace!(entity = E::NAME, id = %model.id(), "latent entity dropped before attachment");
        }
        drop(entity);

        let info = self.store_info(path)?;
        info.store_for(model.kind())
            .await?
            .add_or_update(model)
            .await
    }

    fn enqueue_update(&self, model: E::Model, path: &CachePath) -> Result<()> {
        let broker = self.clone();
        let name = format!("update {} {}", E::NAME, model.id());
        let path = path.clone();
        let task = async move { broker.update_deferred(model, &path).await };
        self.shared
            .queue
            .enqueue(Operation::update(name, Box::pin(task)))
    }
}

/// Indexes of `models` grouped by kind, in first-seen order.
fn group_by_kind<M: Model>(models: &[M]) -> IndexMap<ModelKind, Vec<usize>> {
    let mut groups: IndexMap<ModelKind, Vec<usize>> = IndexMap::new();
    for (i, model) in models.iter().enumerate() {
        groups.entry(model.kind()).or_default().push(i);
    }
    groups
}
