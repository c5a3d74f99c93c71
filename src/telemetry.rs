//! Telemetry metric name constants.
//!
//! Centralised metric names for muninn operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `muninn_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `entity` — entity type name (e.g. "Guild", "CategoryChannel")
//! - `operation` — deferred operation kind ("cleanup", "attach_latent", "update", "barrier")

/// Reference-table hits when resolving an id to a live entity.
///
/// Labels: `entity`.
pub const CACHE_HITS_TOTAL: &str = "muninn_cache_hits_total";

/// Reference-table misses (the broker had to read a store or construct).
///
/// Labels: `entity`.
pub const CACHE_MISSES_TOTAL: &str = "muninn_cache_misses_total";

/// Entities constructed from a model.
///
/// Labels: `entity`.
pub const CONSTRUCTIONS_TOTAL: &str = "muninn_constructions_total";

/// References purged from a broker table after their entity became unreachable.
///
/// Labels: `entity`.
pub const REFERENCES_RECLAIMED_TOTAL: &str = "muninn_references_reclaimed_total";

/// Sibling store reads dropped after another store in the hierarchy answered.
///
/// Labels: `entity`.
pub const STORE_READS_CANCELLED_TOTAL: &str = "muninn_store_reads_cancelled_total";

/// Deferred operations executed by the state controller's queue worker.
///
/// Labels: `operation`.
pub const OPERATIONS_TOTAL: &str = "muninn_operations_total";

/// Deferred operations that returned an error.
///
/// Labels: `operation`.
pub const OPERATION_FAILURES_TOTAL: &str = "muninn_operation_failures_total";
