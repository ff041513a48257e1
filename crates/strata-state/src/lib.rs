//! Staged state and cache container for hybrid DAE simulators.
//!
//! This crate provides [`State`]: a generic incremental-computation
//! substrate that tracks, for an evolving simulation, which quantities
//! are currently valid, which must be recomputed, and in what order
//! recomputation is legal. Independently authored subsystems declare
//! their resources during a bounded configuration window; the
//! container compacts them into contiguous global pools as the stage
//! ledger advances, and every accessor consults the ledger before
//! trusting a value.
//!
//! The numerical algorithms themselves — equations of motion,
//! constraint solvers, integrators, event handlers — live elsewhere
//! and hold only indices and transient references into this container.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

mod cache;
mod discrete;
mod ledger;
mod pool;
mod state;

pub use state::State;

// The core vocabulary types, re-exported so a dependency on this crate
// alone is enough to drive the container.
pub use strata_core::{
    CacheEntryIndex, DiscreteVarIndex, EventTriggerByStageIndex, MultiplierIndex, QErrIndex,
    QIndex, ResourceKind, Stage, StageVersion, StageVersions, StateError, SubsystemIndex,
    SystemEventTriggerIndex, SystemMultiplierIndex, SystemQErrIndex, SystemQIndex,
    SystemUDotErrIndex, SystemUErrIndex, SystemUIndex, SystemYErrIndex, SystemYIndex, SystemZIndex,
    UDotErrIndex, UErrIndex, UIndex, Value, ValueKind, ZIndex, STAGE_VERSION_UNINITIALIZED,
};
