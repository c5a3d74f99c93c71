//! The current user's record.
//!
//! The logged-in user arrives both as a full profile and as the public
//! profile other users see. Once registered, every incoming model of the
//! same type and id is merged into the stored record (see [`Reconcile`]) and
//! the merged record is used in its place, so the richer fields are never
//! overwritten by a restricted view.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::traits::{Model, Reconcile};

struct SelfRecord<M> {
    record: Mutex<M>,
    merge: fn(&mut M, &M),
}

/// Registered self records, one per model type.
#[derive(Default)]
pub(crate) struct SelfModels {
    records: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl SelfModels {
    pub(crate) fn register<M: Reconcile>(&self, model: M) {
        trace!(id = %model.id(), "registered self model");
        let record = SelfRecord {
            record: Mutex::new(model),
            merge: <M as Reconcile>::reconcile,
        };
        self.records
            .write()
            .insert(TypeId::of::<M>(), Box::new(record));
    }

    /// `model` merged into the self record when it is the same user,
    /// otherwise `model` unchanged.
    pub(crate) fn reconcile<M: Model>(&self, model: M) -> M {
        let records = self.records.read();
        let Some(record) = records
            .get(&TypeId::of::<M>())
            .and_then(|r| r.downcast_ref::<SelfRecord<M>>())
        else {
            return model;
        };

        let mut current = record.record.lock();
        if current.id() != model.id() {
            return model;
        }
        (record.merge)(&mut *current, &model);
        current.clone()
    }

    pub(crate) fn get<M: Model>(&self) -> Option<M> {
        self.records
            .read()
            .get(&TypeId::of::<M>())
            .and_then(|r| r.downcast_ref::<SelfRecord<M>>())
            .map(|record| record.record.lock().clone())
    }
}
