//! Collaborator contracts consumed by the cache.
//!
//! The cache never knows the business fields of an entity. It only needs:
//!
//! - [`Model`]: an id and a runtime kind tag for routing.
//! - [`PartialModel`]: a sparse update that can be applied onto a full model.
//! - [`CacheableEntity`]: the static contract of a cached domain type
//!   (construction, store hierarchy, broker hierarchy, model snapshot).
//!
//! Entity types may be unsized: a base type such as `dyn Channel` implements
//! [`CacheableEntity`] directly, and its broker routes concrete channel kinds
//! to sub-brokers for sized types such as `CategoryChannel`.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::Result;
use crate::broker::BrokerHierarchy;
use crate::context::ConstructionContext;
use crate::store::StoreHierarchy;

/// Bound alias for entity ids.
///
/// `Display` is required so ids can form store scopes and log fields;
/// `Ord` is required for range queries.
pub trait EntityId:
    Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> EntityId for T where
    T: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

/// Runtime type tag of a model, used to route it through store and broker
/// hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKind(&'static str);

impl ModelKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A snapshot of wire data that an entity is constructed from.
pub trait Model: Clone + Send + Sync + 'static {
    type Id: EntityId;

    fn id(&self) -> Self::Id;

    /// The concrete kind of this model.
    fn kind(&self) -> ModelKind;
}

/// A sparse model carrying only the fields an event changed.
pub trait PartialModel: Send + Sync {
    type Model: Model;

    /// The id, if the partial carries one.
    fn id(&self) -> Option<<Self::Model as Model>::Id>;

    /// Whether this partial specifies `field`.
    fn is_specified(&self, field: &str) -> bool;

    /// Apply the specified fields onto `base`, returning whether anything changed.
    fn apply_to(&self, base: &mut Self::Model) -> bool;
}

/// Static contract of a cacheable domain type.
///
/// Entities are shared behind `Arc` and mutated only through
/// [`update`](Self::update), so implementations keep their state behind
/// interior mutability. The broker serializes `update` calls per entity.
pub trait CacheableEntity: Send + Sync + 'static {
    type Id: EntityId;
    type Model: Model<Id = Self::Id>;
    /// Actor handed to construction (e.g. a REST-capable handle for the entity).
    type Actor: Send + Sync + 'static;

    /// Name used in logs, metrics and error messages.
    const NAME: &'static str;

    /// Build a new entity from a model.
    fn construct(
        context: &ConstructionContext<'_, Self::Actor>,
        model: &Self::Model,
    ) -> Result<Arc<Self>>;

    /// Re-derive a model snapshot from the current state.
    fn to_model(&self) -> Self::Model;

    /// Merge a newer model into this entity in place.
    fn update(&self, model: &Self::Model) -> Result<()>;

    /// The stores that may hold models of this entity type.
    fn store_hierarchy() -> StoreHierarchy;

    /// Sub-brokers that own some model kinds of this entity type.
    fn broker_hierarchy() -> BrokerHierarchy<Self> {
        BrokerHierarchy::new()
    }

    /// Whether this type constructs models of `kind` itself.
    ///
    /// Kinds routed by [`broker_hierarchy`](Self::broker_hierarchy) never
    /// reach this check on the routing broker.
    fn accepts(kind: ModelKind) -> bool {
        let _ = kind;
        true
    }
}

/// Merge of two views of the same record into their union.
///
/// Used for the current user, which arrives both as a full profile and as a
/// restricted public profile.
pub trait Reconcile: Model {
    fn reconcile(&mut self, incoming: &Self);
}
