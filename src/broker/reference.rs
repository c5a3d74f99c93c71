//! Entity references and handles.
//!
//! An [`EntityReference`] is a broker's record of one live entity: its id, a
//! `Weak` pointer to it, and the set of outstanding handles. It holds no
//! strong claim; the entity stays alive only while handles or external
//! `Arc` clones exist.
//!
//! An [`EntityHandle`] is a strong reference registered with a reference.
//! Dropping it removes it from the handle set. When the dropped handle was
//! the last strong pointer to the entity, the reference asks its broker
//! (through a cleanup operation on the state controller's queue) to purge
//! the now-dead record. If the entity outlives every handle through an
//! external `Arc`, the record stays; once that `Arc` drops the record is
//! dead and is purged the next time it is looked up or swept.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::traits::CacheableEntity;
use crate::{MuninnError, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Callback asking the owning broker to purge a dead reference.
pub(crate) type ReclaimFn<I> = Arc<dyn Fn(&I) + Send + Sync>;

/// Type-erased side of a reference that handles talk to.
pub(crate) trait HandleOwner: Send + Sync {
    fn add_handle(&self) -> u64;

    fn remove_handle(&self, handle_id: u64) -> bool;

    /// Called after a handle dropped its strong pointer.
    fn released(&self);
}

/// A broker's record of one entity.
pub struct EntityReference<E: CacheableEntity + ?Sized> {
    id: E::Id,
    entity: Weak<E>,
    handles: Mutex<HashSet<u64>>,
    killed: AtomicBool,
    // serializes in-place merges into the entity
    merge: Mutex<()>,
    reclaim: ReclaimFn<E::Id>,
}

impl<E: CacheableEntity + ?Sized> EntityReference<E> {
    pub(crate) fn new(id: E::Id, entity: &Arc<E>, reclaim: ReclaimFn<E::Id>) -> Arc<Self> {
        Arc::new(Self {
            id,
            entity: Arc::downgrade(entity),
            handles: Mutex::new(HashSet::new()),
            killed: AtomicBool::new(false),
            merge: Mutex::new(()),
            reclaim,
        })
    }

    pub fn id(&self) -> &E::Id {
        &self.id
    }

    /// Whether the entity is still reachable.
    pub fn is_alive(&self) -> bool {
        !self.is_killed() && self.entity.strong_count() > 0
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Non-allocating liveness check.
    pub fn try_get_entity(&self) -> Option<Arc<E>> {
        if self.is_killed() {
            return None;
        }
        self.entity.upgrade()
    }

    /// Allocate a new handle over the entity.
    ///
    /// With `expected`, the entity must be exactly that object; anything else
    /// is an [`MuninnError::OwnershipMismatch`]. Returns `Ok(None)` and marks
    /// the reference killed if the entity is no longer reachable.
    pub fn allocate_handle(
        self: &Arc<Self>,
        expected: Option<&Arc<E>>,
    ) -> Result<Option<EntityHandle<E>>> {
        let Some(entity) = self.try_get_entity() else {
            self.kill();
            return Ok(None);
        };

        if let Some(expected) = expected
            && !std::ptr::addr_eq(Arc::as_ptr(expected), Arc::as_ptr(&entity))
        {
            return Err(MuninnError::ownership(
                format!("the {} owned by reference {}", E::NAME, self.id),
                "a different object",
            ));
        }

        let handle_id = self.add_handle();
        Ok(Some(EntityHandle {
            id: self.id.clone(),
            entity: Some(entity),
            registration: Some(Registration {
                handle_id,
                owner: Arc::clone(self) as Arc<dyn HandleOwner>,
            }),
        }))
    }

    /// Allocate a handle if the entity is still reachable.
    pub fn handle(self: &Arc<Self>) -> Option<EntityHandle<E>> {
        self.allocate_handle(None).ok().flatten()
    }

    /// Remove `handle_id` from the handle set, returning whether it was present.
    pub fn remove_handle(&self, handle_id: u64) -> bool {
        self.handles.lock().remove(&handle_id)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Merge `model` into the live entity, returning whether it was live.
    pub(crate) fn merge(&self, model: &E::Model) -> Result<bool> {
        let _merge = self.merge.lock();
        match self.try_get_entity() {
            Some(entity) => {
                entity.update(model)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transition to killed; returns whether this call did the transition.
    pub(crate) fn kill(&self) -> bool {
        !self.killed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn owns(&self, handle: &EntityHandle<impl CacheableEntity + ?Sized>) -> bool {
        handle
            .owner_ptr()
            .is_some_and(|owner| std::ptr::addr_eq(owner, self as *const Self))
    }
}

impl<E: CacheableEntity + ?Sized> HandleOwner for EntityReference<E> {
    fn add_handle(&self) -> u64 {
        let handle_id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(handle_id);
        handle_id
    }

    fn remove_handle(&self, handle_id: u64) -> bool {
        EntityReference::remove_handle(self, handle_id)
    }

    fn released(&self) {
        if self.entity.strong_count() == 0 {
            (self.reclaim)(&self.id);
        }
    }
}

impl<E: CacheableEntity + ?Sized> fmt::Debug for EntityReference<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityReference")
            .field("entity", &E::NAME)
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("handles", &self.handle_count())
            .finish()
    }
}

struct Registration {
    handle_id: u64,
    owner: Arc<dyn HandleOwner>,
}

/// Strong, registered reference to a cached entity.
///
/// Dereferences to the entity. Dropping (or [`release`](Self::release)-ing)
/// the handle unregisters it; see the module docs for how that interacts
/// with reclamation.
pub struct EntityHandle<E: CacheableEntity + ?Sized> {
    id: E::Id,
    // only taken in `Drop`
    entity: Option<Arc<E>>,
    registration: Option<Registration>,
}

impl<E: CacheableEntity + ?Sized> EntityHandle<E> {
    pub fn id(&self) -> &E::Id {
        &self.id
    }

    /// The entity this handle keeps alive.
    pub fn entity(&self) -> &Arc<E> {
        self.entity
            .as_ref()
            .expect("handle entity is present until drop")
    }

    /// Unique id of this handle within its reference.
    pub fn handle_id(&self) -> Option<u64> {
        self.registration.as_ref().map(|r| r.handle_id)
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq<U: CacheableEntity + ?Sized>(&self, other: &EntityHandle<U>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self.entity()), Arc::as_ptr(other.entity()))
    }

    /// Whether this handle points at `entity`.
    pub fn is<U: ?Sized>(&self, entity: &Arc<U>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self.entity()), Arc::as_ptr(entity))
    }

    /// Release the handle now.
    pub fn release(self) {
        drop(self);
    }

    /// Convert into a handle of another entity type over the same object,
    /// keeping the same registration (e.g. `CategoryChannel` to `dyn Channel`).
    pub fn map<U>(mut self, upcast: impl FnOnce(Arc<E>) -> Arc<U>) -> EntityHandle<U>
    where
        U: CacheableEntity<Id = E::Id> + ?Sized,
    {
        let registration = self.registration.take();
        let entity = self.entity.take().map(upcast);
        EntityHandle {
            id: self.id.clone(),
            entity,
            registration,
        }
    }

    fn owner_ptr(&self) -> Option<*const ()> {
        self.registration
            .as_ref()
            .map(|r| Arc::as_ptr(&r.owner) as *const ())
    }
}

impl<E: CacheableEntity + ?Sized> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            entity: self.entity.clone(),
            registration: self.registration.as_ref().map(|r| Registration {
                handle_id: r.owner.add_handle(),
                owner: Arc::clone(&r.owner),
            }),
        }
    }
}

impl<E: CacheableEntity + ?Sized> Deref for EntityHandle<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.entity()
    }
}

impl<E: CacheableEntity + ?Sized> Drop for EntityHandle<E> {
    fn drop(&mut self) {
        // drop the strong pointer before the owner checks reachability
        drop(self.entity.take());
        if let Some(registration) = self.registration.take() {
            registration.owner.remove_handle(registration.handle_id);
            registration.owner.released();
        }
    }
}

impl<E: CacheableEntity + ?Sized> fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity", &E::NAME)
            .field("id", &self.id)
            .field("handle_id", &self.handle_id())
            .finish()
    }
}
