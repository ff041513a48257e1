//! Discrete variable records, including the auto-update pairing.
//!
//! A discrete variable is a typed value private to its subsystem.
//! Writing one invalidates its declared stage and everything above it
//! for that subsystem. An *auto-update* variable additionally carries a
//! link to a lazy cache entry of the same payload type holding its
//! pre-computed next value; the swap sweep runs once per step boundary.

use strata_core::{CacheEntryIndex, Stage, Value};

/// One discrete variable.
#[derive(Clone, Debug)]
pub(crate) struct DiscreteVar {
    /// Subsystem stage at allocation (Empty or Topology). Backing the
    /// subsystem below this deallocates the variable.
    pub(crate) alloc_stage: Stage,
    /// The lowest stage a write to this variable invalidates.
    pub(crate) invalidates: Stage,
    /// The stored payload. State-variable storage: plain, mutated only
    /// through exclusive access.
    pub(crate) value: Value,
    /// Time of the last write (or auto-update swap); NaN before the
    /// first one.
    pub(crate) last_update_time: f64,
    /// For auto-update variables, the paired update cache entry.
    pub(crate) update_entry: Option<CacheEntryIndex>,
}

impl DiscreteVar {
    pub(crate) fn new(alloc_stage: Stage, invalidates: Stage, value: Value) -> Self {
        Self {
            alloc_stage,
            invalidates,
            value,
            last_update_time: f64::NAN,
            update_entry: None,
        }
    }

    pub(crate) fn with_update_entry(mut self, entry: CacheEntryIndex) -> Self {
        self.update_entry = Some(entry);
        self
    }
}
