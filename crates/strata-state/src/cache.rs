//! Cache entry records and the validity predicate.
//!
//! A cache entry is trusted under exactly one rule: its explicit
//! realized flag is set, or the owning subsystem's stage has reached
//! the entry's `latest` stage (when one exists — lazy entries have
//! none and can only ever be validated explicitly). Reads never
//! trigger computation; the canonical usage is guard-check →
//! compute-if-absent → mark-realized → return, with exactly one
//! routine owning the check/mark pair for a given entry.
//!
//! The payload sits in a `RefCell` and the flag in a `Cell`: cache
//! entries are deliberately writable through a shared reference to the
//! container, and that is the *only* storage with this property.

use std::cell::{Cell, RefCell};

use strata_core::{Stage, Value};

/// One explicitly allocated cache entry.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    /// Subsystem stage at allocation (Empty, Topology, or Model).
    /// Backing the subsystem below this deallocates the entry.
    pub(crate) alloc_stage: Stage,
    /// Below this stage the value is provably invalid; the realized
    /// flag clears whenever the subsystem is backed below it.
    pub(crate) earliest: Stage,
    /// At or above this stage the value is presumed valid without an
    /// explicit flag. `None` marks a lazy entry with no automatic
    /// realization stage.
    pub(crate) latest: Option<Stage>,
    /// Explicit validity indicator, set by `mark_cache_value_realized`.
    pub(crate) realized: Cell<bool>,
    /// The stored payload.
    pub(crate) value: RefCell<Value>,
}

impl CacheEntry {
    pub(crate) fn new(alloc_stage: Stage, earliest: Stage, latest: Option<Stage>, value: Value) -> Self {
        Self {
            alloc_stage,
            earliest,
            latest,
            realized: Cell::new(false),
            value: RefCell::new(value),
        }
    }

    /// The validity predicate: explicit flag, or stage-presumed when a
    /// `latest` stage exists and has been reached.
    pub(crate) fn is_valid(&self, subsystem_stage: Stage) -> bool {
        self.realized.get() || matches!(self.latest, Some(latest) if subsystem_stage >= latest)
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            alloc_stage: self.alloc_stage,
            earliest: self.earliest,
            latest: self.latest,
            realized: self.realized.clone(),
            value: self.value.clone(),
        }
    }
}
