//! The state controller.
//!
//! [`StateController`] is the entry point of the cache. It owns:
//!
//! - one [`EntityBroker`] per entity type, created on first use;
//! - one [`StoreResolver`] per model type, backed by the registered
//!   [`StoreProvider`](crate::store::StoreProvider) or the configured
//!   default;
//! - the deferred operation queue and its worker task;
//! - the current user's records (see [`register_self`](StateController::register_self)).
//!
//! The convenience methods (`create`, `get`, `update`, ...) look up the
//! broker for the entity type and delegate to it.

mod builder;
mod config;
pub(crate) mod operation;
mod self_user;

pub use builder::StateControllerBuilder;
pub use config::{DEFAULT_STREAM_BUFFER, DEFAULT_SWEEP_INTERVAL_MS, StateConfig};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::BoxStream;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use self::operation::{Operation, OperationQueue};
use self::self_user::SelfModels;
use crate::broker::{BrokerShared, EntityBroker, EntityHandle};
use crate::context::ClientHandle;
use crate::path::CachePath;
use crate::store::{
    DisabledStoreProvider, Direction, MemoryStoreProvider, StoreBackend, StoreProvider,
    StoreResolver,
};
use crate::traits::{CacheableEntity, EntityId, Model, PartialModel, Reconcile};
use crate::{MuninnError, Result};

/// Type-erased view of a broker for controller-wide maintenance.
trait Sweep: Send + Sync {
    fn sweep(&self) -> usize;
}

impl<E: CacheableEntity + ?Sized> Sweep for BrokerShared<E> {
    fn sweep(&self) -> usize {
        BrokerShared::sweep(self)
    }
}

struct BrokerEntry {
    shared: Arc<dyn Any + Send + Sync>,
    sweep: Arc<dyn Sweep>,
}

pub(crate) struct ControllerInner {
    pub(crate) client: ClientHandle,
    pub(crate) config: StateConfig,
    pub(crate) queue: OperationQueue,
    pub(crate) self_models: SelfModels,
    brokers: RwLock<HashMap<TypeId, BrokerEntry>>,
    providers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    resolvers: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ControllerInner {
    pub(crate) fn new(
        config: StateConfig,
        client: ClientHandle,
        providers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            client,
            config,
            queue: OperationQueue::spawn(),
            self_models: SelfModels::default(),
            brokers: RwLock::new(HashMap::new()),
            providers,
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Purge dead references from every broker.
    pub(crate) fn sweep_all(&self) -> usize {
        let brokers: Vec<Arc<dyn Sweep>> = self
            .brokers
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.sweep))
            .collect();
        let reclaimed = brokers.iter().map(|broker| broker.sweep()).sum();
        debug!(reclaimed, "swept all brokers");
        reclaimed
    }

    /// The resolver for model type `M`, created on first use.
    pub(crate) fn resolver<I, M>(&self) -> Result<Arc<StoreResolver<I, M>>>
    where
        I: EntityId,
        M: Model<Id = I>,
    {
        let key = TypeId::of::<M>();
        if let Some(resolver) = self.resolvers.read().get(&key) {
            return downcast_resolver(resolver);
        }

        let mut resolvers = self.resolvers.write();
        if let Some(resolver) = resolvers.get(&key) {
            return downcast_resolver(resolver);
        }

        let resolver = Arc::new(StoreResolver::new(self.provider::<I, M>()?));
        resolvers.insert(key, Arc::clone(&resolver) as Arc<dyn Any + Send + Sync>);
        Ok(resolver)
    }

    fn provider<I, M>(&self) -> Result<Arc<dyn StoreProvider<I, M>>>
    where
        I: EntityId,
        M: Model<Id = I>,
    {
        if let Some(provider) = self.providers.get(&TypeId::of::<M>()) {
            return provider
                .downcast_ref::<Arc<dyn StoreProvider<I, M>>>()
                .cloned()
                .ok_or_else(|| MuninnError::TypeMismatch {
                    expected: std::any::type_name::<M>(),
                    found: "a provider for another id type".to_owned(),
                });
        }

        Ok(match self.config.store_backend {
            StoreBackend::Memory => Arc::new(MemoryStoreProvider::<I, M>::new(
                self.config.max_models_per_store,
            )),
            StoreBackend::Disabled => Arc::new(DisabledStoreProvider::<I, M>::new()),
        })
    }
}

/// Enqueue a sweep of every broker once per `period` until the controller
/// is dropped. The first sweep runs one period after start.
pub(crate) fn spawn_sweeper(controller: Weak<ControllerInner>, period: Duration) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(inner) = controller.upgrade() else {
                break;
            };
            let target = Weak::clone(&controller);
            let task = async move {
                if let Some(inner) = target.upgrade() {
                    inner.sweep_all();
                }
                Ok(())
            };
            if inner
                .queue
                .enqueue(Operation::cleanup("sweep".to_owned(), Box::pin(task)))
                .is_err()
            {
                break;
            }
        }
        trace!("sweeper stopped");
    });
}

fn downcast_resolver<I, M>(resolver: &Arc<dyn Any + Send + Sync>) -> Result<Arc<StoreResolver<I, M>>>
where
    I: EntityId,
    M: Model<Id = I>,
{
    Arc::clone(resolver)
        .downcast::<StoreResolver<I, M>>()
        .map_err(|_| MuninnError::TypeMismatch {
            expected: std::any::type_name::<StoreResolver<I, M>>(),
            found: "a resolver for another model type".to_owned(),
        })
}

fn downcast_broker<E: CacheableEntity + ?Sized>(entry: &BrokerEntry) -> Result<EntityBroker<E>> {
    Arc::clone(&entry.shared)
        .downcast::<BrokerShared<E>>()
        .map(EntityBroker::from_shared)
        .map_err(|_| MuninnError::TypeMismatch {
            expected: E::NAME,
            found: "a broker for another entity type".to_owned(),
        })
}

/// Entry point of the entity cache.
///
/// Cheap to clone; clones share all brokers, stores and the operation queue.
#[derive(Clone)]
pub struct StateController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for StateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateController")
            .field("brokers", &self.inner.brokers.read().len())
            .field("pending_operations", &self.pending_operations())
            .finish()
    }
}

impl StateController {
    pub fn builder() -> StateControllerBuilder {
        StateControllerBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<ControllerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &ClientHandle {
        &self.inner.client
    }

    /// The broker for entity type `E`, created on first use.
    pub fn broker<E: CacheableEntity + ?Sized>(&self) -> Result<EntityBroker<E>> {
        let key = TypeId::of::<E>();
        if let Some(entry) = self.inner.brokers.read().get(&key) {
            return downcast_broker(entry);
        }

        let mut brokers = self.inner.brokers.write();
        if let Some(entry) = brokers.get(&key) {
            return downcast_broker(entry);
        }

        let broker = EntityBroker::<E>::new(&self.inner)?;
        let shared = Arc::clone(broker.shared());
        brokers.insert(
            key,
            BrokerEntry {
                shared: Arc::clone(&shared) as Arc<dyn Any + Send + Sync>,
                sweep: shared as Arc<dyn Sweep>,
            },
        );
        Ok(broker)
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    pub async fn create<E: CacheableEntity + ?Sized>(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<EntityHandle<E>> {
        self.broker::<E>()?.create(model, path, actor).await
    }

    pub async fn get<E: CacheableEntity + ?Sized>(
        &self,
        path: &CachePath,
        id: E::Id,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<Option<EntityHandle<E>>> {
        self.broker::<E>()?.get(path, id, actor).await
    }

    pub fn get_all<E: CacheableEntity + ?Sized>(
        &self,
        path: &CachePath,
    ) -> Result<BoxStream<'static, Result<EntityHandle<E>>>> {
        Ok(self.broker::<E>()?.get_all(path))
    }

    pub fn query<E: CacheableEntity + ?Sized>(
        &self,
        path: &CachePath,
        from: E::Id,
        to: Option<E::Id>,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<BoxStream<'static, Result<EntityHandle<E>>>> {
        Ok(self.broker::<E>()?.query(path, from, to, direction, limit))
    }

    pub async fn update<E: CacheableEntity + ?Sized>(
        &self,
        model: E::Model,
        path: &CachePath,
    ) -> Result<()> {
        self.broker::<E>()?.update(model, path).await
    }

    pub async fn update_partial<E, P>(&self, partial: &P, path: &CachePath) -> Result<bool>
    where
        E: CacheableEntity + ?Sized,
        P: PartialModel<Model = E::Model>,
    {
        self.broker::<E>()?.update_partial(partial, path).await
    }

    pub async fn batch_update<E: CacheableEntity + ?Sized>(
        &self,
        models: Vec<E::Model>,
        path: &CachePath,
    ) -> Result<()> {
        self.broker::<E>()?.batch_update(models, path).await
    }

    pub async fn batch_create_or_update<E: CacheableEntity + ?Sized>(
        &self,
        models: Vec<E::Model>,
        path: &CachePath,
        persist: bool,
    ) -> Result<Vec<EntityHandle<E>>> {
        self.broker::<E>()?
            .batch_create_or_update(models, path, persist)
            .await
    }

    /// Build an entity now and attach it to the cache in the background.
    ///
    /// See [`EntityBroker::create_latent`].
    pub async fn create_latent<E: CacheableEntity + ?Sized>(
        &self,
        model: E::Model,
        path: &CachePath,
        actor: Option<Arc<E::Actor>>,
    ) -> Result<Arc<E>> {
        self.broker::<E>()?.create_latent(model, path, actor).await
    }

    // ========================================================================
    // Self user
    // ========================================================================

    /// Register the current user's record for model type `M`.
    ///
    /// From then on, every model of type `M` with the same id that passes
    /// through a broker is reconciled with this record first.
    pub fn register_self<M: Reconcile>(&self, model: M) {
        self.inner.self_models.register(model);
    }

    /// `model` reconciled with the registered self record, if it is the
    /// current user; otherwise `model` unchanged.
    pub fn reconcile_self<M: Model>(&self, model: M) -> M {
        self.inner.self_models.reconcile(model)
    }

    pub fn self_model<M: Model>(&self) -> Option<M> {
        self.inner.self_models.get()
    }

    // ========================================================================
    // Operation queue
    // ========================================================================

    /// Run `task` on the operation queue after everything enqueued so far.
    pub fn enqueue_cleanup<F>(&self, name: impl Into<String>, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner
            .queue
            .enqueue(Operation::cleanup(name.into(), Box::pin(task)))
    }

    /// Operations enqueued but not yet finished.
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.pending()
    }

    /// Wait until every operation enqueued before this call has run.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.queue.enqueue(Operation::barrier(tx))?;
        rx.await.map_err(|_| MuninnError::Shutdown)
    }

    /// Purge dead references from every broker now.
    ///
    /// The same sweep also runs on the operation queue every
    /// [`StateConfig::sweep_interval_ms`].
    pub fn sweep_all(&self) -> usize {
        self.inner.sweep_all()
    }
}
