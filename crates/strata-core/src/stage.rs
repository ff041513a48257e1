//! The [`Stage`] realization ordering and stage version counters.
//!
//! A stage is a level in the fixed realization sequence a simulation
//! state moves through. The ordering encodes dependency: a quantity
//! realized at some stage may depend only on quantities realized at
//! that stage or below. Backing a state below a stage invalidates
//! everything computed at that stage and above.

use smallvec::SmallVec;
use std::fmt;

/// A realization level in the fixed stage sequence.
///
/// Stages are totally ordered; `Empty` is the floor and `Report` the
/// ceiling. The derived `Ord` follows declaration order. "No stage" /
/// "never automatically realized" is expressed as `Option<Stage>` with
/// `None`, not as an extra variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Nothing has been realized; the container may only be configured.
    Empty,
    /// The set of subsystems and their topology-level resources exist.
    Topology,
    /// Continuous variable pools have been sized and populated.
    Model,
    /// Constraint-error, multiplier, and event-trigger layout is fixed.
    Instance,
    /// The independent variable (time) is valid.
    Time,
    /// Position-level kinematics are valid.
    Position,
    /// Velocity-level kinematics are valid.
    Velocity,
    /// Applied forces and other dynamics-level quantities are valid.
    Dynamics,
    /// Accelerations and constraint multipliers are valid.
    Acceleration,
    /// Reporting-only quantities are valid.
    Report,
}

impl Stage {
    /// Number of stages in the sequence.
    pub const COUNT: usize = 10;

    /// All stages, lowest first.
    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Empty,
        Stage::Topology,
        Stage::Model,
        Stage::Instance,
        Stage::Time,
        Stage::Position,
        Stage::Velocity,
        Stage::Dynamics,
        Stage::Acceleration,
        Stage::Report,
    ];

    /// Position of this stage in the sequence (0 for `Empty`).
    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage at the given sequence position, if any.
    pub fn from_index(index: usize) -> Option<Stage> {
        Stage::ALL.get(index).copied()
    }

    /// The next-higher stage, or `None` for `Report`.
    pub fn next(self) -> Option<Stage> {
        Stage::from_index(self.index() + 1)
    }

    /// The next-lower stage, or `None` for `Empty`.
    pub fn prev(self) -> Option<Stage> {
        self.index().checked_sub(1).and_then(Stage::from_index)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Empty => "Empty",
            Stage::Topology => "Topology",
            Stage::Model => "Model",
            Stage::Instance => "Instance",
            Stage::Time => "Time",
            Stage::Position => "Position",
            Stage::Velocity => "Velocity",
            Stage::Dynamics => "Dynamics",
            Stage::Acceleration => "Acceleration",
            Stage::Report => "Report",
        };
        write!(f, "{name}")
    }
}

/// Version counter for a realized stage.
///
/// A stage's version is set to 1 the first time the stage is realized
/// and incremented each time the stage is invalidated, so any write
/// that disturbs a stage changes its version immediately. −1 means
/// "never realized"; 0 is reserved and never a valid version, so a
/// cached 0 can never compare equal to a live version.
pub type StageVersion = i64;

/// Sentinel version for a stage that has never been realized.
pub const STAGE_VERSION_UNINITIALIZED: StageVersion = -1;

/// Snapshot of the versions of the currently realized system stages.
///
/// Entry `i` is the version of `Stage::from_index(i)`; the snapshot
/// covers `Empty..=` the system stage at the time it was taken. Inline
/// storage covers the full stage sequence, so snapshots never allocate.
pub type StageVersions = SmallVec<[StageVersion; Stage::COUNT]>;
