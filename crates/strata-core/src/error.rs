//! Error types for the Strata staged-state container.
//!
//! Every error here is a contract violation by the caller — nothing is
//! transient or retryable. Messages identify the offending subsystem,
//! resource kind, and index so violations can be eliminated during
//! development rather than handled at run time.

use std::error::Error;
use std::fmt;

use crate::id::{CacheEntryIndex, DiscreteVarIndex, SubsystemIndex};
use crate::stage::{Stage, StageVersion};

/// The kinds of resource a subsystem can allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Position-level continuous variables.
    Q,
    /// Velocity-level continuous variables.
    U,
    /// Auxiliary continuous variables.
    Z,
    /// Position-level constraint-error slots.
    QErr,
    /// Velocity-level constraint-error slots.
    UErr,
    /// Acceleration-level constraint-error slots.
    UDotErr,
    /// Lagrange-multiplier slots.
    Multiplier,
    /// Event-trigger (witness function) slots.
    EventTrigger,
    /// Discrete variables.
    DiscreteVariable,
    /// Explicitly allocated cache entries.
    CacheEntry,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Q => "q",
            ResourceKind::U => "u",
            ResourceKind::Z => "z",
            ResourceKind::QErr => "qerr",
            ResourceKind::UErr => "uerr",
            ResourceKind::UDotErr => "udoterr",
            ResourceKind::Multiplier => "multiplier",
            ResourceKind::EventTrigger => "event trigger",
            ResourceKind::DiscreteVariable => "discrete variable",
            ResourceKind::CacheEntry => "cache entry",
        };
        write!(f, "{name}")
    }
}

/// Errors from the staged state container.
#[derive(Clone, Debug, PartialEq)]
pub enum StateError {
    /// A subsystem stage advance skipped a stage or went backwards.
    StageOutOfOrder {
        /// The subsystem being advanced.
        subsystem: SubsystemIndex,
        /// Its current stage.
        current: Stage,
        /// The requested target stage.
        target: Stage,
    },
    /// A system stage advance skipped a stage or went backwards.
    SystemStageOutOfOrder {
        /// The current system stage.
        current: Stage,
        /// The requested target stage.
        target: Stage,
    },
    /// The system cannot advance because a subsystem is not there yet.
    SystemAdvanceBlocked {
        /// The requested target stage.
        target: Stage,
        /// The lagging subsystem.
        subsystem: SubsystemIndex,
        /// The lagging subsystem's current stage.
        subsystem_stage: Stage,
    },
    /// A subsystem was registered after the configuration window closed.
    RegistrationClosed {
        /// The system stage at the time of the attempt.
        current: Stage,
    },
    /// A resource was allocated after its allocation window closed.
    AllocationWindowClosed {
        /// The allocating subsystem.
        subsystem: SubsystemIndex,
        /// The kind of resource requested.
        kind: ResourceKind,
        /// The subsystem's stage at the time of the attempt.
        current: Stage,
        /// The stage at which the window closes.
        cutoff: Stage,
    },
    /// A stage-gated access was made before the stage was realized.
    StageNotReached {
        /// The stage the access requires.
        required: Stage,
        /// The current stage.
        current: Stage,
    },
    /// A cache entry was read while its validity predicate is false.
    CacheNotRealized {
        /// The owning subsystem.
        subsystem: SubsystemIndex,
        /// The entry that was read.
        index: CacheEntryIndex,
    },
    /// An index referred to a resource that was never allocated.
    UnallocatedResource {
        /// The subsystem the index was presented for.
        subsystem: SubsystemIndex,
        /// The kind of resource addressed.
        kind: ResourceKind,
        /// The out-of-range index.
        index: u32,
    },
    /// A cache entry was marked realized below its earliest stage.
    MarkBelowEarliest {
        /// The owning subsystem.
        subsystem: SubsystemIndex,
        /// The entry being marked.
        index: CacheEntryIndex,
        /// The entry's earliest stage.
        earliest: Stage,
        /// The subsystem's current stage.
        current: Stage,
    },
    /// A discrete variable declared an invalidates stage at or below
    /// its own allocation stage.
    InvalidatesNotAboveAllocation {
        /// The allocating subsystem.
        subsystem: SubsystemIndex,
        /// The rejected invalidates stage.
        invalidates: Stage,
        /// The subsystem's stage at allocation.
        allocation: Stage,
    },
    /// An auto-update variable declared an invalidates stage at or
    /// below `Time`.
    AutoUpdateInvalidatesTooLow {
        /// The allocating subsystem.
        subsystem: SubsystemIndex,
        /// The rejected invalidates stage.
        invalidates: Stage,
    },
    /// A discrete variable without an update pairing was used through
    /// the auto-update accessors.
    NotAutoUpdate {
        /// The owning subsystem.
        subsystem: SubsystemIndex,
        /// The variable addressed.
        index: DiscreteVarIndex,
    },
    /// The shared-access invalidation path was asked to invalidate a
    /// stage below `Instance`, which could destroy state variables.
    InvalidateTooLow {
        /// The rejected stage.
        stage: Stage,
    },
    /// A bulk setter was handed a slice of the wrong length.
    SizeMismatch {
        /// The kind of pool being written.
        kind: ResourceKind,
        /// The pool's length.
        expected: usize,
        /// The supplied slice's length.
        got: usize,
    },
    /// The container's topology version does not match the system
    /// description it is allegedly a state for.
    TopologyVersionMismatch {
        /// The version recorded in the container.
        state_version: StageVersion,
        /// The version the system description expects.
        system_version: StageVersion,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageOutOfOrder {
                subsystem,
                current,
                target,
            } => write!(
                f,
                "subsystem {subsystem} at stage {current} cannot advance to {target}; \
                 stages advance one at a time"
            ),
            Self::SystemStageOutOfOrder { current, target } => write!(
                f,
                "system at stage {current} cannot advance to {target}; \
                 stages advance one at a time"
            ),
            Self::SystemAdvanceBlocked {
                target,
                subsystem,
                subsystem_stage,
            } => write!(
                f,
                "system cannot advance to {target}: subsystem {subsystem} \
                 is still at stage {subsystem_stage}"
            ),
            Self::RegistrationClosed { current } => write!(
                f,
                "subsystems can only be registered at stage Empty (system is at {current})"
            ),
            Self::AllocationWindowClosed {
                subsystem,
                kind,
                current,
                cutoff,
            } => write!(
                f,
                "subsystem {subsystem} cannot allocate {kind} at stage {current}; \
                 the window closes at {cutoff}"
            ),
            Self::StageNotReached { required, current } => write!(
                f,
                "access requires stage {required} but the system is at {current}"
            ),
            Self::CacheNotRealized { subsystem, index } => write!(
                f,
                "cache entry {index} of subsystem {subsystem} has not been realized"
            ),
            Self::UnallocatedResource {
                subsystem,
                kind,
                index,
            } => write!(
                f,
                "subsystem {subsystem} has no {kind} with index {index}"
            ),
            Self::MarkBelowEarliest {
                subsystem,
                index,
                earliest,
                current,
            } => write!(
                f,
                "cache entry {index} of subsystem {subsystem} cannot be marked \
                 realized at stage {current}; its earliest stage is {earliest}"
            ),
            Self::InvalidatesNotAboveAllocation {
                subsystem,
                invalidates,
                allocation,
            } => write!(
                f,
                "discrete variable of subsystem {subsystem} must invalidate a stage \
                 above its allocation stage {allocation} (got {invalidates})"
            ),
            Self::AutoUpdateInvalidatesTooLow {
                subsystem,
                invalidates,
            } => write!(
                f,
                "auto-update variable of subsystem {subsystem} must invalidate a \
                 stage above Time (got {invalidates})"
            ),
            Self::NotAutoUpdate { subsystem, index } => write!(
                f,
                "discrete variable {index} of subsystem {subsystem} has no \
                 auto-update cache entry"
            ),
            Self::InvalidateTooLow { stage } => write!(
                f,
                "cache-only invalidation is limited to stage Instance and above \
                 (got {stage}); lower stages require exclusive access"
            ),
            Self::SizeMismatch {
                kind,
                expected,
                got,
            } => write!(
                f,
                "{kind} pool has length {expected} but the supplied slice has length {got}"
            ),
            Self::TopologyVersionMismatch {
                state_version,
                system_version,
            } => write!(
                f,
                "topology version mismatch: state has {state_version}, \
                 system description expects {system_version}"
            ),
        }
    }
}

impl Error for StateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = StateError::UnallocatedResource {
            subsystem: SubsystemIndex(2),
            kind: ResourceKind::CacheEntry,
            index: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains('2'), "{msg}");
        assert!(msg.contains("cache entry"), "{msg}");
        assert!(msg.contains('7'), "{msg}");
    }

    #[test]
    fn ordering_error_names_both_stages() {
        let err = StateError::StageOutOfOrder {
            subsystem: SubsystemIndex(0),
            current: Stage::Topology,
            target: Stage::Instance,
        };
        let msg = err.to_string();
        assert!(msg.contains("Topology"), "{msg}");
        assert!(msg.contains("Instance"), "{msg}");
    }

    #[test]
    fn implements_std_error() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&StateError::InvalidateTooLow {
            stage: Stage::Model,
        });
    }
}
