//! Builder for state controllers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::config::StateConfig;
use super::{ControllerInner, StateController, spawn_sweeper};
use crate::context::ClientHandle;
use crate::store::StoreProvider;
use crate::traits::Model;
use crate::{MuninnError, Result};

/// Builder for configuring a [`StateController`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use muninn::{StateConfig, StateController};
///
/// struct Client;
///
/// #[tokio::main]
/// async fn main() -> muninn::Result<()> {
///     let state = StateController::builder()
///         .client(Arc::new(Client))
///         .config(StateConfig::new().lock_timeout_ms(5_000))
///         .build()?;
///     state.flush().await
/// }
/// ```
pub struct StateControllerBuilder {
    config: StateConfig,
    client: Option<ClientHandle>,
    providers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl StateControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: StateConfig::default(),
            client: None,
            providers: HashMap::new(),
        }
    }

    pub fn config(mut self, config: StateConfig) -> Self {
        self.config = config;
        self
    }

    /// The client entities are constructed against.
    pub fn client<C: Any + Send + Sync>(mut self, client: Arc<C>) -> Self {
        self.client = Some(client as ClientHandle);
        self
    }

    pub fn client_handle(mut self, client: ClientHandle) -> Self {
        self.client = Some(client);
        self
    }

    /// Use `provider` for stores of model type `M`.
    ///
    /// Model types without a provider get one according to
    /// [`StateConfig::store_backend`].
    pub fn store_provider<M: Model>(mut self, provider: Arc<dyn StoreProvider<M::Id, M>>) -> Self {
        self.providers.insert(TypeId::of::<M>(), Box::new(provider));
        self
    }

    /// Build the controller and start its operation queue worker, plus the
    /// periodic sweep when [`StateConfig::sweep_interval_ms`] is set.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Result<StateController> {
        self.config.validate()?;
        let client = self.client.ok_or_else(|| {
            MuninnError::Configuration("a client is required to build a state controller".to_owned())
        })?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MuninnError::Configuration(
                "a state controller must be built within a tokio runtime".to_owned(),
            ));
        }

        let sweep_interval = self.config.sweep_interval();
        let inner = Arc::new(ControllerInner::new(self.config, client, self.providers));
        if let Some(period) = sweep_interval {
            spawn_sweeper(Arc::downgrade(&inner), period);
        }
        Ok(StateController::from_inner(inner))
    }
}

impl Default for StateControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
