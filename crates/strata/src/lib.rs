//! Strata: a staged state-and-cache container for hybrid DAE
//! simulators.
//!
//! This is the top-level facade crate that re-exports the public API
//! from the Strata sub-crates. For most users, adding `strata` as a
//! single dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use strata::prelude::*;
//!
//! // A subsystem registers itself and declares its resources while
//! // the configuration window is open.
//! let mut state = State::new();
//! let matter = state.add_subsystem("matter", "1.0").unwrap();
//! let q0 = state.allocate_q(matter, &[0.0, 1.0, 0.0]).unwrap();
//! assert_eq!(q0, QIndex(0));
//!
//! // A lazy cache entry: computable from Position, validated only by
//! // explicit marking.
//! let energy = state
//!     .allocate_lazy_cache_entry(matter, Stage::Position, Value::Real(0.0))
//!     .unwrap();
//!
//! // The driver advances one stage at a time; the global pools
//! // materialize when Model is reached.
//! for target in [Stage::Topology, Stage::Model] {
//!     state.advance_subsystem_to_stage(matter, target).unwrap();
//!     state.advance_system_to_stage(target).unwrap();
//! }
//! assert_eq!(state.q().unwrap(), &[0.0, 1.0, 0.0]);
//!
//! // Continue up to Position so the entry becomes computable, then
//! // run the canonical lazy pattern through a shared reference.
//! for target in [Stage::Instance, Stage::Time, Stage::Position] {
//!     state.advance_subsystem_to_stage(matter, target).unwrap();
//!     state.advance_system_to_stage(target).unwrap();
//! }
//! let shared: &State = &state;
//! if !shared.is_cache_value_realized(matter, energy).unwrap() {
//!     *shared.upd_cache_entry(matter, energy).unwrap() = Value::Real(0.5);
//!     shared.mark_cache_value_realized(matter, energy).unwrap();
//! }
//! assert_eq!(*shared.cache_entry(matter, energy).unwrap(), Value::Real(0.5));
//!
//! // Writing a state variable backs the disturbed stages out again.
//! state.upd_q().unwrap()[1] = 2.0;
//! assert!(state.cache_entry(matter, energy).is_err());
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in
//! the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `strata-core` | Stages, versions, indices, values, errors |
//! | [`state`] | `strata-state` | The [`prelude::State`] container |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core vocabulary types (`strata-core`).
///
/// Contains the [`types::Stage`] ordering, stage version counters,
/// strongly-typed resource indices, the [`types::Value`] variant type,
/// and the [`types::StateError`] taxonomy.
pub use strata_core as types;

/// The staged state-and-cache container (`strata-state`).
///
/// [`state::State`] is the single handle numerical algorithms hold;
/// it is also available in the [`prelude`].
pub use strata_state as state;

/// Common imports for typical Strata usage.
///
/// ```rust
/// use strata::prelude::*;
/// ```
pub mod prelude {
    // The container.
    pub use strata_state::State;

    // Stages and versions.
    pub use strata_core::{Stage, StageVersion, StageVersions};

    // Indices.
    pub use strata_core::{
        CacheEntryIndex, DiscreteVarIndex, EventTriggerByStageIndex, QErrIndex, QIndex,
        SubsystemIndex, SystemQIndex, SystemUIndex, SystemYIndex, SystemZIndex, UDotErrIndex,
        UErrIndex, UIndex, ZIndex,
    };

    // Values and errors.
    pub use strata_core::{ResourceKind, StateError, Value, ValueKind};
}
