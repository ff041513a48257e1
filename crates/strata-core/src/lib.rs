//! Core types for the Strata staged-state framework.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the fundamental abstractions used throughout the Strata workspace:
//! the realization [`Stage`] ordering, stage version counters,
//! strongly-typed resource indices, the closed [`Value`] variant type,
//! and the [`StateError`] taxonomy.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod id;
pub mod stage;
pub mod value;

pub use error::{ResourceKind, StateError};
pub use id::{
    CacheEntryIndex, DiscreteVarIndex, EventTriggerByStageIndex, MultiplierIndex, QErrIndex,
    QIndex, SubsystemIndex, SystemEventTriggerIndex, SystemMultiplierIndex, SystemQErrIndex,
    SystemQIndex, SystemUDotErrIndex, SystemUErrIndex, SystemUIndex, SystemYErrIndex, SystemYIndex,
    SystemZIndex, UDotErrIndex, UErrIndex, UIndex, ZIndex,
};
pub use stage::{Stage, StageVersion, StageVersions, STAGE_VERSION_UNINITIALIZED};
pub use value::{Value, ValueKind};
