//! Synchronization primitives.

mod keyed;

pub use keyed::{KeyedGuard, KeyedMutex};
