//! Stage ledger: per-subsystem realization levels, stage version
//! counters, and the invalidation dependency table.
//!
//! The ledger is pure bookkeeping — it records which stage each
//! subsystem has reached and how often each stage has been disturbed.
//! Resource storage reacts to the ledger but lives elsewhere
//! ([`crate::pool`]).
//!
//! Stage and version fields use `Cell` because realization bookkeeping
//! must be reachable through a shared reference: backing cache stages
//! out (`invalidate_all_cache_at_or_above`) is explicitly a
//! shared-access operation.

use std::cell::Cell;

use indexmap::IndexMap;
use strata_core::{Stage, StageVersion, StageVersions, SubsystemIndex, STAGE_VERSION_UNINITIALIZED};

/// Per-stage invalidation dependency table.
///
/// Row `g` lists the stages that must be invalidated when `g` is
/// disturbed: `g` itself and every higher stage, in order. Built once
/// at construction and walked on every backup, so the cascade is a
/// data-driven sweep rather than a convention each write site must
/// remember.
#[derive(Debug)]
pub(crate) struct InvalidationTable {
    dependents: [Vec<Stage>; Stage::COUNT],
}

impl InvalidationTable {
    fn new() -> Self {
        let dependents = std::array::from_fn(|i| {
            Stage::ALL.iter().copied().filter(|s| s.index() >= i).collect()
        });
        Self { dependents }
    }

    /// The stages invalidated when `stage` is disturbed, lowest first.
    pub(crate) fn dependents(&self, stage: Stage) -> &[Stage] {
        &self.dependents[stage.index()]
    }
}

/// Ledger row for one subsystem.
#[derive(Debug)]
pub(crate) struct SubsystemLedger {
    /// Human-readable name, stored but not interpreted.
    pub(crate) name: String,
    /// Opaque version string for compatibility checks.
    pub(crate) version: String,
    /// The stage this subsystem has been realized to.
    current: Cell<Stage>,
    /// Per-stage version counters; see [`StageVersion`].
    versions: [Cell<StageVersion>; Stage::COUNT],
}

impl SubsystemLedger {
    fn new(name: String, version: String) -> Self {
        let row = Self {
            name,
            version,
            current: Cell::new(Stage::Empty),
            versions: std::array::from_fn(|_| Cell::new(STAGE_VERSION_UNINITIALIZED)),
        };
        // Empty is realized from birth.
        row.versions[Stage::Empty.index()].set(1);
        row
    }

    pub(crate) fn stage(&self) -> Stage {
        self.current.get()
    }

    pub(crate) fn version_of(&self, stage: Stage) -> StageVersion {
        self.versions[stage.index()].get()
    }
}

impl Clone for SubsystemLedger {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            current: self.current.clone(),
            versions: std::array::from_fn(|i| self.versions[i].clone()),
        }
    }
}

/// The stage ledger: subsystem rows plus the system-level row.
///
/// Invariant: the system stage never exceeds the minimum subsystem
/// stage. Advancing runs strictly one stage at a time so every
/// intermediate realization runs exactly once per transition.
#[derive(Debug)]
pub(crate) struct StageLedger {
    subsystems: Vec<SubsystemLedger>,
    /// Deterministic-order name lookup; first registration wins.
    by_name: IndexMap<String, SubsystemIndex>,
    system_stage: Cell<Stage>,
    system_versions: [Cell<StageVersion>; Stage::COUNT],
    table: InvalidationTable,
}

impl StageLedger {
    pub(crate) fn new() -> Self {
        let ledger = Self {
            subsystems: Vec::new(),
            by_name: IndexMap::new(),
            system_stage: Cell::new(Stage::Empty),
            system_versions: std::array::from_fn(|_| Cell::new(STAGE_VERSION_UNINITIALIZED)),
            table: InvalidationTable::new(),
        };
        ledger.system_versions[Stage::Empty.index()].set(1);
        ledger
    }

    pub(crate) fn add(&mut self, name: &str, version: &str) -> SubsystemIndex {
        let index = SubsystemIndex(self.subsystems.len() as u32);
        self.subsystems
            .push(SubsystemLedger::new(name.to_string(), version.to_string()));
        self.by_name.entry(name.to_string()).or_insert(index);
        index
    }

    pub(crate) fn set_name(&mut self, sx: SubsystemIndex, name: &str, version: &str) {
        let row = &mut self.subsystems[sx.0 as usize];
        row.name = name.to_string();
        row.version = version.to_string();
        self.by_name.entry(name.to_string()).or_insert(sx);
    }

    pub(crate) fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub(crate) fn row(&self, sx: SubsystemIndex) -> &SubsystemLedger {
        &self.subsystems[sx.0 as usize]
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = (SubsystemIndex, &SubsystemLedger)> {
        self.subsystems
            .iter()
            .enumerate()
            .map(|(i, row)| (SubsystemIndex(i as u32), row))
    }

    pub(crate) fn find(&self, name: &str) -> Option<SubsystemIndex> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn system_stage(&self) -> Stage {
        self.system_stage.get()
    }

    pub(crate) fn system_version_of(&self, stage: Stage) -> StageVersion {
        self.system_versions[stage.index()].get()
    }

    pub(crate) fn set_system_version(&self, stage: Stage, version: StageVersion) {
        self.system_versions[stage.index()].set(version);
    }

    /// Move a subsystem up one stage. The caller has already validated
    /// the transition; this records it and initializes the version
    /// counter on first realization.
    pub(crate) fn advance_subsystem(&self, sx: SubsystemIndex, target: Stage) {
        let row = &self.subsystems[sx.0 as usize];
        row.current.set(target);
        let cell = &row.versions[target.index()];
        if cell.get() == STAGE_VERSION_UNINITIALIZED {
            cell.set(1);
        }
    }

    /// Move the system up one stage, initializing its version counter
    /// on first realization.
    pub(crate) fn advance_system(&self, target: Stage) {
        self.system_stage.set(target);
        let cell = &self.system_versions[target.index()];
        if cell.get() == STAGE_VERSION_UNINITIALIZED {
            cell.set(1);
        }
    }

    /// Back a subsystem below `stage` if it is at or above it, bumping
    /// the version of every invalidated stage. Returns `true` if the
    /// subsystem actually moved.
    pub(crate) fn backup_subsystem(&self, sx: SubsystemIndex, stage: Stage) -> bool {
        let row = &self.subsystems[sx.0 as usize];
        let current = row.current.get();
        if current < stage {
            return false;
        }
        for &dep in self.table.dependents(stage) {
            if dep > current {
                break;
            }
            bump(&row.versions[dep.index()]);
        }
        row.current.set(stage.prev().unwrap_or(Stage::Empty));
        true
    }

    /// Back the system below `stage` if it is at or above it, bumping
    /// the version of every invalidated stage.
    pub(crate) fn backup_system(&self, stage: Stage) -> bool {
        let current = self.system_stage.get();
        if current < stage {
            return false;
        }
        for &dep in self.table.dependents(stage) {
            if dep > current {
                break;
            }
            bump(&self.system_versions[dep.index()]);
        }
        self.system_stage.set(stage.prev().unwrap_or(Stage::Empty));
        true
    }

    /// Cap every subsystem stage and the system stage at `cap` without
    /// bumping versions. Used by checkpoint copies, which are realized
    /// no further than `cap` but keep their change-detection history.
    pub(crate) fn cap_stages(&self, cap: Stage) {
        for row in &self.subsystems {
            if row.current.get() > cap {
                row.current.set(cap);
            }
        }
        if self.system_stage.get() > cap {
            self.system_stage.set(cap);
        }
    }

    /// Snapshot the versions of the currently realized system stages.
    pub(crate) fn snapshot(&self) -> StageVersions {
        (0..=self.system_stage.get().index())
            .map(|i| self.system_versions[i].get())
            .collect()
    }

    /// The lowest stage whose version differs from `prev`, or the
    /// first previously-realized stage that is no longer realized.
    /// `None` means every stage the caller cared about is unchanged,
    /// even if higher stages have since been realized.
    pub(crate) fn lowest_difference(&self, prev: &StageVersions) -> Option<Stage> {
        let realized = self.system_stage.get().index();
        for (i, &version) in prev.iter().enumerate() {
            let stage = Stage::from_index(i)?;
            if i > realized || self.system_versions[i].get() != version {
                return Some(stage);
            }
        }
        None
    }
}

impl Clone for StageLedger {
    fn clone(&self) -> Self {
        Self {
            subsystems: self.subsystems.clone(),
            by_name: self.by_name.clone(),
            system_stage: self.system_stage.clone(),
            system_versions: std::array::from_fn(|i| self.system_versions[i].clone()),
            table: InvalidationTable::new(),
        }
    }
}

/// Bump a version counter past an invalidation, skipping the reserved
/// value 0 so a stale comparison can never match.
fn bump(cell: &Cell<StageVersion>) {
    let v = cell.get();
    cell.set(if v < 1 { 1 } else { v + 1 });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_subsystem_ledger() -> StageLedger {
        let mut ledger = StageLedger::new();
        ledger.add("matter", "1.0");
        ledger.add("forces", "0.3");
        ledger
    }

    fn advance_all(ledger: &StageLedger, to: Stage) {
        for target in Stage::ALL {
            if target == Stage::Empty || target > to {
                continue;
            }
            for (sx, _) in ledger.rows() {
                ledger.advance_subsystem(sx, target);
            }
            ledger.advance_system(target);
        }
    }

    #[test]
    fn dependency_table_lists_stage_and_above() {
        let table = InvalidationTable::new();
        assert_eq!(
            table.dependents(Stage::Acceleration),
            &[Stage::Acceleration, Stage::Report]
        );
        assert_eq!(table.dependents(Stage::Report), &[Stage::Report]);
        assert_eq!(table.dependents(Stage::Empty).len(), Stage::COUNT);
    }

    #[test]
    fn versions_start_uninitialized_except_empty() {
        let ledger = two_subsystem_ledger();
        let row = ledger.row(SubsystemIndex(0));
        assert_eq!(row.version_of(Stage::Empty), 1);
        for stage in &Stage::ALL[1..] {
            assert_eq!(row.version_of(*stage), STAGE_VERSION_UNINITIALIZED);
        }
    }

    #[test]
    fn first_realization_sets_version_one() {
        let ledger = two_subsystem_ledger();
        ledger.advance_subsystem(SubsystemIndex(0), Stage::Topology);
        assert_eq!(ledger.row(SubsystemIndex(0)).version_of(Stage::Topology), 1);
    }

    #[test]
    fn backup_bumps_invalidated_stages_only() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Position);

        let sx = SubsystemIndex(0);
        assert!(ledger.backup_subsystem(sx, Stage::Position));
        let row = ledger.row(sx);
        assert_eq!(row.stage(), Stage::Time);
        assert_eq!(row.version_of(Stage::Position), 2);
        assert_eq!(row.version_of(Stage::Time), 1);
        assert_eq!(row.version_of(Stage::Model), 1);
    }

    #[test]
    fn backup_below_current_is_a_no_op() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Model);
        assert!(!ledger.backup_subsystem(SubsystemIndex(0), Stage::Time));
        assert_eq!(ledger.row(SubsystemIndex(0)).stage(), Stage::Model);
    }

    #[test]
    fn reinvalidation_keeps_versions_monotone() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Time);

        let mut last = ledger.system_version_of(Stage::Time);
        for _ in 0..5 {
            ledger.backup_system(Stage::Time);
            ledger.advance_system(Stage::Time);
            let now = ledger.system_version_of(Stage::Time);
            assert!(now > last);
            assert_ne!(now, 0);
            last = now;
        }
    }

    #[test]
    fn snapshot_covers_realized_stages() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Instance);
        let snap = ledger.snapshot();
        assert_eq!(snap.len(), Stage::Instance.index() + 1);
    }

    #[test]
    fn diff_detects_bumped_stage() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Position);
        let snap = ledger.snapshot();

        ledger.backup_system(Stage::Position);
        assert_eq!(ledger.lowest_difference(&snap), Some(Stage::Position));

        // Re-realizing does not hide the disturbance.
        ledger.advance_system(Stage::Position);
        assert_eq!(ledger.lowest_difference(&snap), Some(Stage::Position));
    }

    #[test]
    fn diff_ignores_newly_realized_higher_stages() {
        let ledger = two_subsystem_ledger();
        advance_all(&ledger, Stage::Time);
        let snap = ledger.snapshot();

        advance_all(&ledger, Stage::Velocity);
        assert_eq!(ledger.lowest_difference(&snap), None);
    }

    #[test]
    fn find_returns_first_registration() {
        let mut ledger = StageLedger::new();
        let first = ledger.add("matter", "1.0");
        ledger.add("matter", "2.0");
        assert_eq!(ledger.find("matter"), Some(first));
        assert_eq!(ledger.find("unknown"), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn versions_never_zero_under_churn(cycles in 1usize..20) {
                let ledger = two_subsystem_ledger();
                advance_all(&ledger, Stage::Report);
                for _ in 0..cycles {
                    ledger.backup_system(Stage::Time);
                    for target in [
                        Stage::Time,
                        Stage::Position,
                        Stage::Velocity,
                        Stage::Dynamics,
                        Stage::Acceleration,
                        Stage::Report,
                    ] {
                        ledger.advance_system(target);
                    }
                }
                for stage in Stage::ALL {
                    prop_assert_ne!(ledger.system_version_of(stage), 0);
                }
            }
        }
    }
}
