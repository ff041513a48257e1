//! Strongly-typed resource indices.
//!
//! Every resource the container hands out is addressed by a dedicated
//! index newtype, split into two families: subsystem-local indices
//! (the first resource of each kind belonging to a subsystem has index
//! 0) and system-global indices into the compacted pools that exist
//! once the relevant stage has been reached. Keeping the families as
//! distinct types makes it a compile error to hand a local index to a
//! global accessor or vice versa.

use std::fmt;

macro_rules! define_index {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                Self(v)
            }
        }
    };
}

define_index! {
    /// Identifies a subsystem registered with the container.
    ///
    /// Assigned sequentially at registration; `SubsystemIndex(n)` is
    /// the n-th subsystem added.
    SubsystemIndex
}

define_index! {
    /// Subsystem-local index into that subsystem's position variables.
    QIndex
}
define_index! {
    /// Subsystem-local index into that subsystem's velocity variables.
    UIndex
}
define_index! {
    /// Subsystem-local index into that subsystem's auxiliary variables.
    ZIndex
}

define_index! {
    /// Global index into the compacted position-variable pool.
    SystemQIndex
}
define_index! {
    /// Global index into the compacted velocity-variable pool.
    SystemUIndex
}
define_index! {
    /// Global index into the compacted auxiliary-variable pool.
    SystemZIndex
}
define_index! {
    /// Global index into the logical y view: all q, then all u, then
    /// all z. There is no subsystem-local equivalent.
    SystemYIndex
}

define_index! {
    /// Subsystem-local index into position-level constraint-error slots.
    QErrIndex
}
define_index! {
    /// Subsystem-local index into velocity-level constraint-error slots.
    UErrIndex
}
define_index! {
    /// Subsystem-local index into acceleration-level constraint-error
    /// slots. Allocating one of these also allocates the multiplier
    /// slot of the same index.
    UDotErrIndex
}
define_index! {
    /// Subsystem-local index into Lagrange-multiplier slots; always
    /// partitioned identically to the acceleration-level error slots.
    MultiplierIndex
}

define_index! {
    /// Global index into the compacted position-error pool.
    SystemQErrIndex
}
define_index! {
    /// Global index into the compacted velocity-error pool.
    SystemUErrIndex
}
define_index! {
    /// Global index into the compacted acceleration-error pool.
    SystemUDotErrIndex
}
define_index! {
    /// Global index into the compacted multiplier pool.
    SystemMultiplierIndex
}
define_index! {
    /// Global index into the logical yerr view: all position errors,
    /// then all velocity errors.
    SystemYErrIndex
}

define_index! {
    /// Subsystem-local index of a discrete variable. Discrete variables
    /// are private to their subsystem; there is no global equivalent.
    DiscreteVarIndex
}
define_index! {
    /// Subsystem-local index of an explicitly allocated cache entry.
    /// Cache entries are private to their subsystem; there is no global
    /// equivalent.
    CacheEntryIndex
}

define_index! {
    /// Index of an event-trigger slot, local to both a subsystem and
    /// the stage at which the trigger is evaluated.
    EventTriggerByStageIndex
}
define_index! {
    /// Global index into the event-trigger layout: triggers grouped by
    /// evaluation stage first, subsystem within each stage.
    SystemEventTriggerIndex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_bare_number() {
        assert_eq!(SubsystemIndex(3).to_string(), "3");
        assert_eq!(QIndex(0).to_string(), "0");
        assert_eq!(SystemEventTriggerIndex(17).to_string(), "17");
    }

    #[test]
    fn from_u32_round_trips() {
        let ix: CacheEntryIndex = 5u32.into();
        assert_eq!(ix, CacheEntryIndex(5));
        assert_eq!(ix.0, 5);
    }

    #[test]
    fn ordering_follows_value() {
        assert!(DiscreteVarIndex(1) < DiscreteVarIndex(2));
        assert!(SystemQIndex(0) < SystemQIndex(10));
    }
}
