//! Muninn - identity-preserving entity cache
//!
//! This crate caches long-lived domain entities (guilds, channels, users,
//! ...) built from wire models. For any entity type and id, at most one live
//! entity object exists at a time: every lookup, creation and update goes
//! through that type's [`EntityBroker`], which hands out [`EntityHandle`]s
//! to the same object for as long as anything keeps it alive.
//!
//! Models (never entities) are persisted in [`Store`](store::Store)s
//! supplied by a [`StoreProvider`](store::StoreProvider). Stores may be
//! scoped by an ancestor entity through a [`CachePath`], and an entity type
//! may spread its models over several stores per model kind.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use muninn::store::{StoreHierarchy, StoreSpec, StoreType};
//! use muninn::{CachePath, CacheableEntity, ConstructionContext, Model, ModelKind, StateController};
//!
//! #[derive(Clone)]
//! struct UserModel { id: u64, name: String }
//!
//! impl Model for UserModel {
//!     type Id = u64;
//!     fn id(&self) -> u64 { self.id }
//!     fn kind(&self) -> ModelKind { ModelKind::new("user") }
//! }
//!
//! struct User { id: u64, name: parking_lot::RwLock<String> }
//!
//! impl CacheableEntity for User {
//!     type Id = u64;
//!     type Model = UserModel;
//!     type Actor = ();
//!     const NAME: &'static str = "User";
//!
//!     fn construct(_: &ConstructionContext<'_, ()>, model: &UserModel) -> muninn::Result<Arc<Self>> {
//!         Ok(Arc::new(User { id: model.id, name: parking_lot::RwLock::new(model.name.clone()) }))
//!     }
//!     fn to_model(&self) -> UserModel {
//!         UserModel { id: self.id, name: self.name.read().clone() }
//!     }
//!     fn update(&self, model: &UserModel) -> muninn::Result<()> {
//!         *self.name.write() = model.name.clone();
//!         Ok(())
//!     }
//!     fn store_hierarchy() -> StoreHierarchy {
//!         StoreHierarchy::new(StoreSpec::global(StoreType::new("users")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> muninn::Result<()> {
//!     struct Client;
//!     let state = StateController::builder().client(Arc::new(Client)).build()?;
//!     let path = CachePath::new();
//!
//!     let model = UserModel { id: 1, name: "hugin".into() };
//!     let a = state.create::<User>(model.clone(), &path, None).await?;
//!     let b = state.create::<User>(model, &path, None).await?;
//!     assert!(a.ptr_eq(&b));
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod context;
pub mod error;
pub mod path;
pub mod state;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod traits;

// Re-export main types at crate root
pub use broker::{BrokerHierarchy, EntityBroker, EntityHandle, EntityReference, LatentSlot};
pub use context::{ClientHandle, ConstructionContext};
pub use error::{MuninnError, Result};
pub use path::{CachePath, Scope};
pub use state::{
    DEFAULT_STREAM_BUFFER, DEFAULT_SWEEP_INTERVAL_MS, StateConfig, StateController,
    StateControllerBuilder,
};
pub use store::Direction;
pub use traits::{CacheableEntity, EntityId, Model, ModelKind, PartialModel, Reconcile};
