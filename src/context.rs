//! Construction context handed to entity constructors.

use std::any::Any;
use std::sync::Arc;

use crate::path::CachePath;

/// Opaque handle to the client that owns the cache.
///
/// Entities downcast it with [`ConstructionContext::client`] to reach
/// client-level services (REST routes, configuration).
pub type ClientHandle = Arc<dyn Any + Send + Sync>;

/// Everything an entity constructor may need besides the model.
pub struct ConstructionContext<'a, A> {
    client: &'a ClientHandle,
    path: &'a CachePath,
    actor: Option<&'a Arc<A>>,
}

impl<'a, A> ConstructionContext<'a, A> {
    pub fn new(client: &'a ClientHandle, path: &'a CachePath, actor: Option<&'a Arc<A>>) -> Self {
        Self {
            client,
            path,
            actor,
        }
    }

    /// The client, if it is of type `C`.
    pub fn client<C: Any>(&self) -> Option<&'a C> {
        self.client.downcast_ref::<C>()
    }

    pub fn client_handle(&self) -> &'a ClientHandle {
        self.client
    }

    pub fn path(&self) -> &'a CachePath {
        self.path
    }

    /// The actor supplied by the caller, if any.
    pub fn actor(&self) -> Option<&'a Arc<A>> {
        self.actor
    }
}
