//! The [`State`] façade: the staged state-and-cache container.
//!
//! A `State` holds everything a hybrid DAE simulation varies over
//! time, partitioned among independently authored subsystems:
//! continuous variables (q, u, z) with their derivative caches,
//! constraint-error slots and Lagrange multipliers, discrete
//! variables, typed cache entries, and event-trigger slots. The stage
//! ledger governs which of it may currently be trusted.
//!
//! # Access discipline
//!
//! State variables are read through `&self` and written through
//! `&mut self`; every write invalidates the stage the variable was
//! declared to disturb, bumping its version counters. Cache storage
//! is written through `&self` (realization routines hold only a shared
//! reference), returning `Ref`/`RefMut` guards; hold them briefly and
//! never across a stage change. Because the cache side uses interior
//! mutability, `State` is not `Sync`: fanning realization across
//! threads requires partitioning work above this container.
//!
//! Methods taking a [`SubsystemIndex`] panic if the index is out of
//! range; every other misuse is reported through [`StateError`].

use std::cell::{Ref, RefMut};
use std::fmt;
use std::fmt::Write as _;
use std::mem;

use strata_core::{
    CacheEntryIndex, DiscreteVarIndex, EventTriggerByStageIndex, QErrIndex, QIndex, ResourceKind,
    Stage, StageVersion, StageVersions, StateError, SubsystemIndex, SystemEventTriggerIndex,
    SystemMultiplierIndex, SystemQErrIndex, SystemQIndex, SystemUDotErrIndex, SystemUErrIndex,
    SystemUIndex, SystemYIndex, SystemZIndex, UDotErrIndex, UErrIndex, UIndex, Value, ZIndex,
};

use crate::cache::CacheEntry;
use crate::discrete::DiscreteVar;
use crate::ledger::StageLedger;
use crate::pool::{ContinuousRequest, CountRequest, SubsystemResources, SystemPool, TriggerRequest};

/// The staged state-and-cache container backing a hybrid DAE simulator.
///
/// See the [module documentation](self) for the access discipline. The
/// lifecycle is: register subsystems at stage `Empty`, declare
/// resources while the relevant allocation windows are open, advance
/// subsystems and then the system one stage at a time, and read/write
/// through the stage-gated accessors. Cloning checkpoints state
/// variables only — never cache (see [`State::clone`]).
#[derive(Debug)]
pub struct State {
    ledger: StageLedger,
    subsystems: Vec<SubsystemResources>,
    pool: SystemPool,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Create an empty container at stage `Empty` with no subsystems.
    pub fn new() -> Self {
        Self {
            ledger: StageLedger::new(),
            subsystems: Vec::new(),
            pool: SystemPool::new(),
        }
    }

    /// Restore the default-constructed condition, dropping every
    /// subsystem and resource.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    // ── Subsystem registry ───────────────────────────────────────

    /// Register a subsystem as a client of this container.
    ///
    /// The name and version strings are stored but not interpreted;
    /// they exist so a checkpoint can be sanity-checked against the
    /// system that produced it. Legal only at stage `Empty`.
    pub fn add_subsystem(&mut self, name: &str, version: &str) -> Result<SubsystemIndex, StateError> {
        let current = self.ledger.system_stage();
        if current != Stage::Empty {
            return Err(StateError::RegistrationClosed { current });
        }
        let index = self.ledger.add(name, version);
        self.subsystems.push(SubsystemResources::new());
        Ok(index)
    }

    /// Wipe the container and re-create it with `n` anonymous
    /// subsystem slots. Use [`State::initialize_subsystem`] to name them.
    pub fn set_num_subsystems(&mut self, n: usize) {
        self.clear();
        for _ in 0..n {
            let _ = self.add_subsystem("", "");
        }
    }

    /// Set the name and version of an already-allocated subsystem slot.
    pub fn initialize_subsystem(&mut self, sx: SubsystemIndex, name: &str, version: &str) {
        self.ledger.set_name(sx, name, version);
    }

    /// Number of registered subsystems.
    pub fn num_subsystems(&self) -> usize {
        self.ledger.len()
    }

    /// The stored name of a subsystem.
    pub fn subsystem_name(&self, sx: SubsystemIndex) -> &str {
        &self.ledger.row(sx).name
    }

    /// The stored version string of a subsystem.
    pub fn subsystem_version(&self, sx: SubsystemIndex) -> &str {
        &self.ledger.row(sx).version
    }

    /// The stage a subsystem has been realized to.
    pub fn subsystem_stage(&self, sx: SubsystemIndex) -> Stage {
        self.ledger.row(sx).stage()
    }

    /// Look up a subsystem by name (first registration wins).
    pub fn find_subsystem(&self, name: &str) -> Option<SubsystemIndex> {
        self.ledger.find(name)
    }

    /// The global (system-level) stage; never exceeds the minimum
    /// subsystem stage.
    pub fn system_stage(&self) -> Stage {
        self.ledger.system_stage()
    }

    // ── Stage control ────────────────────────────────────────────

    /// Advance a subsystem by exactly one stage to `target`.
    ///
    /// Skipping a stage (or going backwards) is an ordering error, so
    /// every intermediate realization runs exactly once per
    /// transition. Advancing to `Model` compacts the subsystem's
    /// declared q/u/z into the global pools and sizes the matching
    /// derivative caches; advancing to `Instance` does the same for
    /// constraint-error slots, multipliers, and event triggers.
    pub fn advance_subsystem_to_stage(
        &mut self,
        sx: SubsystemIndex,
        target: Stage,
    ) -> Result<(), StateError> {
        let current = self.ledger.row(sx).stage();
        if current.next() != Some(target) {
            return Err(StateError::StageOutOfOrder {
                subsystem: sx,
                current,
                target,
            });
        }
        match target {
            Stage::Model => self.materialize_model(sx),
            Stage::Instance => self.materialize_instance(sx),
            _ => {}
        }
        self.ledger.advance_subsystem(sx, target);
        Ok(())
    }

    /// Advance the system by exactly one stage to `target`.
    ///
    /// Legal only once every subsystem has reached `target`; fails
    /// naming the first laggard otherwise. Advancing to `Model`
    /// initializes time to 0 and the u/z weights to 1; advancing to
    /// `Instance` initializes the constraint-error weights to 1.
    pub fn advance_system_to_stage(&mut self, target: Stage) -> Result<(), StateError> {
        let current = self.ledger.system_stage();
        if current.next() != Some(target) {
            return Err(StateError::SystemStageOutOfOrder { current, target });
        }
        for (sx, row) in self.ledger.rows() {
            if row.stage() < target {
                return Err(StateError::SystemAdvanceBlocked {
                    target,
                    subsystem: sx,
                    subsystem_stage: row.stage(),
                });
            }
        }
        match target {
            Stage::Model => {
                self.pool.time = 0.0;
                self.pool.u_weights = vec![1.0; self.nu()];
                self.pool.z_weights = vec![1.0; self.nz()];
            }
            Stage::Instance => {
                self.pool.qerr_weights = vec![1.0; self.nqerr()];
                self.pool.uerr_weights = vec![1.0; self.nuerr()];
            }
            _ => {}
        }
        self.ledger.advance_system(target);
        Ok(())
    }

    /// Back every subsystem at or above `stage` up to just below it,
    /// deallocating everything allocated at or above `stage`.
    ///
    /// This is the write-access invalidation: crossing the `Model` or
    /// `Topology` boundary downward destroys state variables (values
    /// are lost; declarations survive down to their own allocation
    /// stage). For cache-only invalidation through a shared reference
    /// use [`State::invalidate_all_cache_at_or_above`].
    pub fn invalidate_all(&mut self, stage: Stage) {
        for (i, res) in self.subsystems.iter_mut().enumerate() {
            let sx = SubsystemIndex(i as u32);
            if self.ledger.backup_subsystem(sx, stage) {
                res.clear_realized_at_or_above(stage);
            }
            res.discard_requests_at_or_above(stage);
        }
        self.ledger.backup_system(stage);
        if stage <= Stage::Instance {
            self.pool.clear_instance_cache();
            self.pool.qerr_weights.clear();
            self.pool.uerr_weights.clear();
            for res in &self.subsystems {
                res.clear_instance_offsets();
            }
        }
        if stage <= Stage::Model {
            self.pool.clear_model_storage();
            for res in &mut self.subsystems {
                res.clear_model_offsets();
            }
        }
    }

    /// Back every subsystem at or above `stage` up to just below it,
    /// restricted to cache and derived storage.
    ///
    /// Callable through a shared reference because it cannot destroy
    /// state variables; `stage` must therefore be `Instance` or above.
    pub fn invalidate_all_cache_at_or_above(&self, stage: Stage) -> Result<(), StateError> {
        if stage < Stage::Instance {
            return Err(StateError::InvalidateTooLow { stage });
        }
        self.invalidate_cache_from(stage);
        Ok(())
    }

    /// Shared-access invalidation core; `stage` is `Instance` or above.
    fn invalidate_cache_from(&self, stage: Stage) {
        for (sx, res) in self.resources() {
            if self.ledger.backup_subsystem(sx, stage) {
                res.clear_realized_at_or_above(stage);
            }
        }
        self.ledger.backup_system(stage);
        if stage == Stage::Instance {
            self.pool.clear_instance_cache();
            for (_, res) in self.resources() {
                res.clear_instance_offsets();
            }
        }
    }

    /// Back one subsystem (and the system minimum) below `stage`;
    /// used by discrete-variable writes, whose effects are private to
    /// the owner. `stage` is above `Instance`.
    fn backup_subsystem_cache(&self, sx: SubsystemIndex, stage: Stage) {
        if self.ledger.backup_subsystem(sx, stage) {
            self.res(sx).clear_realized_at_or_above(stage);
        }
        self.ledger.backup_system(stage);
    }

    // ── Stage versions and compatibility ─────────────────────────

    /// Record the version numbers of every currently realized system
    /// stage. Use with [`State::lowest_system_stage_difference`] to
    /// determine exactly how much an opaque operation disturbed, even
    /// if it re-realized the disturbed stages afterward.
    pub fn system_stage_versions(&self) -> StageVersions {
        self.ledger.snapshot()
    }

    /// The lowest system stage whose version differs from `prev`, or
    /// the first previously-realized stage that is no longer realized.
    /// `None` means nothing the caller cared about has changed, even
    /// if higher stages have since been realized.
    pub fn lowest_system_stage_difference(&self, prev: &StageVersions) -> Option<Stage> {
        self.ledger.lowest_difference(prev)
    }

    /// The Topology stage version, used as the compatibility token
    /// between this container and the system description it belongs to.
    pub fn system_topology_stage_version(&self) -> StageVersion {
        self.ledger.system_version_of(Stage::Topology)
    }

    /// Force the Topology stage version. Only for re-binding a
    /// checkpoint to a system whose topology version is known to be
    /// compatible; has no effect on the realization level.
    pub fn set_system_topology_stage_version(&mut self, version: StageVersion) {
        self.ledger.set_system_version(Stage::Topology, version);
    }

    /// Check the compatibility token against the owning system's
    /// topology version. Call before any simulation proceeds; a
    /// mismatch is fatal configuration, not a recoverable condition.
    pub fn require_topology_stage_version(
        &self,
        system_version: StageVersion,
    ) -> Result<(), StateError> {
        let state_version = self.system_topology_stage_version();
        if state_version != system_version {
            return Err(StateError::TopologyVersionMismatch {
                state_version,
                system_version,
            });
        }
        Ok(())
    }

    // ── Continuous variable allocation ───────────────────────────

    /// Declare `init.len()` position variables for a subsystem,
    /// initialized from `init`. Legal while the subsystem is below
    /// `Model`; returns the subsystem-local index of the first slot.
    /// The matching qdot and qdotdot cache slots are sized alongside
    /// when the pool materializes.
    pub fn allocate_q(&mut self, sx: SubsystemIndex, init: &[f64]) -> Result<QIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::Q, Stage::Model)?;
        let res = self.res_mut(sx);
        let local = res.nq() as u32;
        res.q_requests.push(ContinuousRequest {
            alloc_stage: current,
            init: init.to_vec(),
        });
        Ok(QIndex(local))
    }

    /// Declare velocity variables; see [`State::allocate_q`]. The
    /// matching udot cache slots are sized alongside.
    pub fn allocate_u(&mut self, sx: SubsystemIndex, init: &[f64]) -> Result<UIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::U, Stage::Model)?;
        let res = self.res_mut(sx);
        let local = res.nu() as u32;
        res.u_requests.push(ContinuousRequest {
            alloc_stage: current,
            init: init.to_vec(),
        });
        Ok(UIndex(local))
    }

    /// Declare auxiliary variables; see [`State::allocate_q`]. The
    /// matching zdot cache slots are sized alongside.
    pub fn allocate_z(&mut self, sx: SubsystemIndex, init: &[f64]) -> Result<ZIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::Z, Stage::Model)?;
        let res = self.res_mut(sx);
        let local = res.nz() as u32;
        res.z_requests.push(ContinuousRequest {
            alloc_stage: current,
            init: init.to_vec(),
        });
        Ok(ZIndex(local))
    }

    // ── Constraint-error and trigger allocation (cache side) ─────

    /// Declare `count` position-level constraint-error slots. Cache
    /// allocation: callable through a shared reference while the
    /// subsystem is below `Instance`.
    pub fn allocate_qerr(&self, sx: SubsystemIndex, count: u32) -> Result<QErrIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::QErr, Stage::Instance)?;
        let res = self.res(sx);
        let local = res.nqerr() as u32;
        res.qerr_requests.borrow_mut().push(CountRequest {
            alloc_stage: current,
            count,
        });
        Ok(QErrIndex(local))
    }

    /// Declare velocity-level constraint-error slots; see
    /// [`State::allocate_qerr`].
    pub fn allocate_uerr(&self, sx: SubsystemIndex, count: u32) -> Result<UErrIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::UErr, Stage::Instance)?;
        let res = self.res(sx);
        let local = res.nuerr() as u32;
        res.uerr_requests.borrow_mut().push(CountRequest {
            alloc_stage: current,
            count,
        });
        Ok(UErrIndex(local))
    }

    /// Declare acceleration-level constraint-error slots. This also
    /// allocates the Lagrange-multiplier slots of the same indices;
    /// the two pools are always partitioned identically.
    pub fn allocate_udoterr(
        &self,
        sx: SubsystemIndex,
        count: u32,
    ) -> Result<UDotErrIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::UDotErr, Stage::Instance)?;
        let res = self.res(sx);
        let local = res.nudoterr() as u32;
        res.udoterr_requests.borrow_mut().push(CountRequest {
            alloc_stage: current,
            count,
        });
        Ok(UDotErrIndex(local))
    }

    /// Declare `count` event-trigger (witness function) slots to be
    /// evaluated at `stage`. The returned index is local to both the
    /// subsystem and the stage. Callable through a shared reference
    /// while the subsystem is below `Instance`.
    pub fn allocate_event_trigger(
        &self,
        sx: SubsystemIndex,
        stage: Stage,
        count: u32,
    ) -> Result<EventTriggerByStageIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::EventTrigger, Stage::Instance)?;
        let res = self.res(sx);
        let local = res.n_triggers_at(stage) as u32;
        res.trigger_requests.borrow_mut().push(TriggerRequest {
            alloc_stage: current,
            stage,
            count,
        });
        Ok(EventTriggerByStageIndex(local))
    }

    // ── Global dimensions ────────────────────────────────────────

    /// Total number of position variables declared. Final once every
    /// subsystem has reached `Model`.
    pub fn nq(&self) -> usize {
        self.subsystems.iter().map(|r| r.nq()).sum()
    }

    /// Total number of velocity variables declared.
    pub fn nu(&self) -> usize {
        self.subsystems.iter().map(|r| r.nu()).sum()
    }

    /// Total number of auxiliary variables declared.
    pub fn nz(&self) -> usize {
        self.subsystems.iter().map(|r| r.nz()).sum()
    }

    /// Total length of the logical y view: `nq + nu + nz`.
    pub fn ny(&self) -> usize {
        self.nq() + self.nu() + self.nz()
    }

    /// Index within the logical y view at which the q's begin.
    pub fn q_start(&self) -> SystemYIndex {
        SystemYIndex(0)
    }

    /// Index within the logical y view at which the u's begin.
    pub fn u_start(&self) -> SystemYIndex {
        SystemYIndex(self.nq() as u32)
    }

    /// Index within the logical y view at which the z's begin.
    pub fn z_start(&self) -> SystemYIndex {
        SystemYIndex((self.nq() + self.nu()) as u32)
    }

    /// Total number of position-level constraint-error slots. Final
    /// once every subsystem has reached `Instance`.
    pub fn nqerr(&self) -> usize {
        self.subsystems.iter().map(|r| r.nqerr()).sum()
    }

    /// Total number of velocity-level constraint-error slots.
    pub fn nuerr(&self) -> usize {
        self.subsystems.iter().map(|r| r.nuerr()).sum()
    }

    /// Total length of the logical yerr view: `nqerr + nuerr`.
    pub fn nyerr(&self) -> usize {
        self.nqerr() + self.nuerr()
    }

    /// Total number of acceleration-level constraint-error slots.
    pub fn nudoterr(&self) -> usize {
        self.subsystems.iter().map(|r| r.nudoterr()).sum()
    }

    /// Total number of Lagrange multipliers; necessarily equal to
    /// [`State::nudoterr`].
    pub fn n_multipliers(&self) -> usize {
        self.nudoterr()
    }

    /// Total number of event-trigger slots across all stages.
    pub fn n_event_triggers(&self) -> usize {
        Stage::ALL
            .iter()
            .map(|&s| self.n_event_triggers_by_stage(s))
            .sum()
    }

    /// Number of event-trigger slots evaluated at `stage`.
    pub fn n_event_triggers_by_stage(&self, stage: Stage) -> usize {
        self.subsystems.iter().map(|r| r.n_triggers_at(stage)).sum()
    }

    /// Index within the stage-major global trigger layout at which
    /// `stage`'s triggers begin.
    pub fn event_trigger_start_by_stage(&self, stage: Stage) -> SystemEventTriggerIndex {
        let before: usize = Stage::ALL
            .iter()
            .take_while(|&&s| s < stage)
            .map(|&s| self.n_event_triggers_by_stage(s))
            .sum();
        SystemEventTriggerIndex(before as u32)
    }

    // ── Per-subsystem dimensions ─────────────────────────────────

    /// Number of position variables declared by one subsystem.
    pub fn nq_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nq()
    }

    /// Number of velocity variables declared by one subsystem.
    pub fn nu_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nu()
    }

    /// Number of auxiliary variables declared by one subsystem.
    pub fn nz_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nz()
    }

    /// Global offset of a subsystem's q slice; requires the subsystem
    /// to have reached `Model`.
    pub fn q_start_of(&self, sx: SubsystemIndex) -> Result<SystemQIndex, StateError> {
        self.res(sx).q_start.ok_or(StateError::StageNotReached {
            required: Stage::Model,
            current: self.ledger.row(sx).stage(),
        })
    }

    /// Global offset of a subsystem's u slice; requires `Model`.
    pub fn u_start_of(&self, sx: SubsystemIndex) -> Result<SystemUIndex, StateError> {
        self.res(sx).u_start.ok_or(StateError::StageNotReached {
            required: Stage::Model,
            current: self.ledger.row(sx).stage(),
        })
    }

    /// Global offset of a subsystem's z slice; requires `Model`.
    pub fn z_start_of(&self, sx: SubsystemIndex) -> Result<SystemZIndex, StateError> {
        self.res(sx).z_start.ok_or(StateError::StageNotReached {
            required: Stage::Model,
            current: self.ledger.row(sx).stage(),
        })
    }

    /// Number of position-error slots declared by one subsystem.
    pub fn nqerr_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nqerr()
    }

    /// Number of velocity-error slots declared by one subsystem.
    pub fn nuerr_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nuerr()
    }

    /// Number of acceleration-error slots declared by one subsystem.
    pub fn nudoterr_of(&self, sx: SubsystemIndex) -> usize {
        self.res(sx).nudoterr()
    }

    /// Global offset of a subsystem's qerr slice; requires `Instance`.
    pub fn qerr_start_of(&self, sx: SubsystemIndex) -> Result<SystemQErrIndex, StateError> {
        self.res(sx)
            .qerr_start
            .get()
            .ok_or(StateError::StageNotReached {
                required: Stage::Instance,
                current: self.ledger.row(sx).stage(),
            })
    }

    /// Global offset of a subsystem's uerr slice; requires `Instance`.
    pub fn uerr_start_of(&self, sx: SubsystemIndex) -> Result<SystemUErrIndex, StateError> {
        self.res(sx)
            .uerr_start
            .get()
            .ok_or(StateError::StageNotReached {
                required: Stage::Instance,
                current: self.ledger.row(sx).stage(),
            })
    }

    /// Global offset of a subsystem's udoterr slice; requires
    /// `Instance`.
    pub fn udoterr_start_of(&self, sx: SubsystemIndex) -> Result<SystemUDotErrIndex, StateError> {
        self.res(sx)
            .udoterr_start
            .get()
            .ok_or(StateError::StageNotReached {
                required: Stage::Instance,
                current: self.ledger.row(sx).stage(),
            })
    }

    /// Global offset of a subsystem's multiplier slice; always the
    /// same as its udoterr offset.
    pub fn multipliers_start_of(
        &self,
        sx: SubsystemIndex,
    ) -> Result<SystemMultiplierIndex, StateError> {
        self.udoterr_start_of(sx)
            .map(|ix| SystemMultiplierIndex(ix.0))
    }

    /// Number of a subsystem's trigger slots at `stage`.
    pub fn n_event_triggers_by_stage_of(&self, sx: SubsystemIndex, stage: Stage) -> usize {
        self.res(sx).n_triggers_at(stage)
    }

    // ── Time ─────────────────────────────────────────────────────

    /// The current value of the independent variable. Requires the
    /// system to have reached `Model`.
    pub fn time(&self) -> Result<f64, StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(self.pool.time)
    }

    /// Writable access to time; invalidates the `Time` stage.
    pub fn upd_time(&mut self) -> Result<&mut f64, StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Time);
        Ok(&mut self.pool.time)
    }

    /// Set time; equivalent to writing through [`State::upd_time`].
    pub fn set_time(&mut self, t: f64) -> Result<(), StateError> {
        *self.upd_time()? = t;
        Ok(())
    }

    // ── Continuous variable access ───────────────────────────────

    /// The global position-variable pool. Requires `Model`.
    pub fn q(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(&self.pool.q)
    }

    /// Writable access to the global q pool; invalidates `Position`.
    pub fn upd_q(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Position);
        Ok(&mut self.pool.q)
    }

    /// Overwrite the global q pool; invalidates `Position`.
    pub fn set_q(&mut self, values: &[f64]) -> Result<(), StateError> {
        check_len(ResourceKind::Q, self.pool.q.len(), values.len())?;
        self.upd_q()?.copy_from_slice(values);
        Ok(())
    }

    /// The global velocity-variable pool. Requires `Model`.
    pub fn u(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(&self.pool.u)
    }

    /// Writable access to the global u pool; invalidates `Velocity`.
    pub fn upd_u(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Velocity);
        Ok(&mut self.pool.u)
    }

    /// Overwrite the global u pool; invalidates `Velocity`.
    pub fn set_u(&mut self, values: &[f64]) -> Result<(), StateError> {
        check_len(ResourceKind::U, self.pool.u.len(), values.len())?;
        self.upd_u()?.copy_from_slice(values);
        Ok(())
    }

    /// The global auxiliary-variable pool. Requires `Model`.
    pub fn z(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(&self.pool.z)
    }

    /// Writable access to the global z pool; invalidates `Dynamics`.
    pub fn upd_z(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Dynamics);
        Ok(&mut self.pool.z)
    }

    /// Overwrite the global z pool; invalidates `Dynamics`.
    pub fn set_z(&mut self, values: &[f64]) -> Result<(), StateError> {
        check_len(ResourceKind::Z, self.pool.z.len(), values.len())?;
        self.upd_z()?.copy_from_slice(values);
        Ok(())
    }

    /// Copy the logical y view {q, u, z} into `out`. Requires `Model`.
    pub fn copy_y(&self, out: &mut [f64]) -> Result<(), StateError> {
        self.require_system_stage(Stage::Model)?;
        check_len(ResourceKind::Q, self.pool.q.len() + self.pool.u.len() + self.pool.z.len(), out.len())?;
        let (nq, nu) = (self.pool.q.len(), self.pool.u.len());
        out[..nq].copy_from_slice(&self.pool.q);
        out[nq..nq + nu].copy_from_slice(&self.pool.u);
        out[nq + nu..].copy_from_slice(&self.pool.z);
        Ok(())
    }

    /// Overwrite the logical y view {q, u, z} from `y`; invalidates
    /// `Position` (the lowest stage any component of y can disturb).
    pub fn set_y(&mut self, y: &[f64]) -> Result<(), StateError> {
        self.require_system_stage(Stage::Model)?;
        let (nq, nu, nz) = (self.pool.q.len(), self.pool.u.len(), self.pool.z.len());
        check_len(ResourceKind::Q, nq + nu + nz, y.len())?;
        self.invalidate_cache_from(Stage::Position);
        self.pool.q.copy_from_slice(&y[..nq]);
        self.pool.u.copy_from_slice(&y[nq..nq + nu]);
        self.pool.z.copy_from_slice(&y[nq + nu..]);
        Ok(())
    }

    /// One subsystem's q slice. The subsystem must have reached
    /// `Model` (its slice exists from then on, even while the system
    /// lags behind).
    pub fn q_of(&self, sx: SubsystemIndex) -> Result<&[f64], StateError> {
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        Ok(&self.pool.q[start..start + len])
    }

    /// Writable access to one subsystem's q slice; invalidates
    /// `Position` system-wide (the pool is shared).
    pub fn upd_q_of(&mut self, sx: SubsystemIndex) -> Result<&mut [f64], StateError> {
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        self.invalidate_cache_from(Stage::Position);
        Ok(&mut self.pool.q[start..start + len])
    }

    /// One subsystem's u slice; requires that subsystem at `Model`.
    pub fn u_of(&self, sx: SubsystemIndex) -> Result<&[f64], StateError> {
        let (start, len) = (self.u_start_of(sx)?.0 as usize, self.res(sx).nu());
        Ok(&self.pool.u[start..start + len])
    }

    /// Writable access to one subsystem's u slice; invalidates
    /// `Velocity` system-wide.
    pub fn upd_u_of(&mut self, sx: SubsystemIndex) -> Result<&mut [f64], StateError> {
        let (start, len) = (self.u_start_of(sx)?.0 as usize, self.res(sx).nu());
        self.invalidate_cache_from(Stage::Velocity);
        Ok(&mut self.pool.u[start..start + len])
    }

    /// One subsystem's z slice; requires that subsystem at `Model`.
    pub fn z_of(&self, sx: SubsystemIndex) -> Result<&[f64], StateError> {
        let (start, len) = (self.z_start_of(sx)?.0 as usize, self.res(sx).nz());
        Ok(&self.pool.z[start..start + len])
    }

    /// Writable access to one subsystem's z slice; invalidates
    /// `Dynamics` system-wide.
    pub fn upd_z_of(&mut self, sx: SubsystemIndex) -> Result<&mut [f64], StateError> {
        let (start, len) = (self.z_start_of(sx)?.0 as usize, self.res(sx).nz());
        self.invalidate_cache_from(Stage::Dynamics);
        Ok(&mut self.pool.z[start..start + len])
    }

    // ── Weights ──────────────────────────────────────────────────

    /// Unit weights for the u's (1/unit change), sized and set to 1 at
    /// `Model`. Requires `Model`.
    pub fn u_weights(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(&self.pool.u_weights)
    }

    /// Writable u weights; invalidates only `Report` (weights do not
    /// enter the derivative calculations).
    pub fn upd_u_weights(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Report);
        Ok(&mut self.pool.u_weights)
    }

    /// Unit weights for the z's, sized and set to 1 at `Model`.
    pub fn z_weights(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(&self.pool.z_weights)
    }

    /// Writable z weights; invalidates only `Report`.
    pub fn upd_z_weights(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Model)?;
        self.invalidate_cache_from(Stage::Report);
        Ok(&mut self.pool.z_weights)
    }

    /// Unit weights for the position constraint errors, sized and set
    /// to 1 at `Instance`. Requires `Instance`.
    pub fn qerr_weights(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(&self.pool.qerr_weights)
    }

    /// Writable qerr weights; invalidates `Position` to force
    /// recalculation of weighted constraint errors.
    pub fn upd_qerr_weights(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Instance)?;
        self.invalidate_cache_from(Stage::Position);
        Ok(&mut self.pool.qerr_weights)
    }

    /// Unit weights for the velocity constraint errors, sized and set
    /// to 1 at `Instance`.
    pub fn uerr_weights(&self) -> Result<&[f64], StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(&self.pool.uerr_weights)
    }

    /// Writable uerr weights; invalidates `Velocity`.
    pub fn upd_uerr_weights(&mut self) -> Result<&mut [f64], StateError> {
        self.require_system_stage(Stage::Instance)?;
        self.invalidate_cache_from(Stage::Velocity);
        Ok(&mut self.pool.uerr_weights)
    }

    // ── Derivative caches ────────────────────────────────────────

    /// The qdot cache. Reading requires `Velocity`; writing (through
    /// [`State::upd_qdot`]) is available from `Model`, through a
    /// shared reference, and affects no stage — callers mark stages
    /// realized through the ledger, not here.
    pub fn qdot(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Velocity)?;
        Ok(Ref::map(self.pool.qdot.borrow(), Vec::as_slice))
    }

    /// Writable qdot cache; available from `Model`.
    pub fn upd_qdot(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(RefMut::map(self.pool.qdot.borrow_mut(), Vec::as_mut_slice))
    }

    /// The qdotdot cache. Reading requires `Acceleration`.
    pub fn qdotdot(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Acceleration)?;
        Ok(Ref::map(self.pool.qdotdot.borrow(), Vec::as_slice))
    }

    /// Writable qdotdot cache; available from `Model`.
    pub fn upd_qdotdot(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(RefMut::map(self.pool.qdotdot.borrow_mut(), Vec::as_mut_slice))
    }

    /// The udot cache. Reading requires `Acceleration`.
    pub fn udot(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Acceleration)?;
        Ok(Ref::map(self.pool.udot.borrow(), Vec::as_slice))
    }

    /// Writable udot cache; available from `Model`.
    pub fn upd_udot(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(RefMut::map(self.pool.udot.borrow_mut(), Vec::as_mut_slice))
    }

    /// The zdot cache. Reading requires `Dynamics`.
    pub fn zdot(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Dynamics)?;
        Ok(Ref::map(self.pool.zdot.borrow(), Vec::as_slice))
    }

    /// Writable zdot cache; available from `Model`.
    pub fn upd_zdot(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Model)?;
        Ok(RefMut::map(self.pool.zdot.borrow_mut(), Vec::as_mut_slice))
    }

    /// Copy the logical ydot view {qdot, udot, zdot} into `out`.
    /// Requires `Acceleration`.
    pub fn copy_ydot(&self, out: &mut [f64]) -> Result<(), StateError> {
        self.require_system_stage(Stage::Acceleration)?;
        let qdot = self.pool.qdot.borrow();
        let udot = self.pool.udot.borrow();
        let zdot = self.pool.zdot.borrow();
        check_len(ResourceKind::Q, qdot.len() + udot.len() + zdot.len(), out.len())?;
        let (nq, nu) = (qdot.len(), udot.len());
        out[..nq].copy_from_slice(&qdot);
        out[nq..nq + nu].copy_from_slice(&udot);
        out[nq + nu..].copy_from_slice(&zdot);
        Ok(())
    }

    /// One subsystem's qdot slice. Reading requires that subsystem at
    /// `Velocity`; its own realization routine writes the slice via
    /// [`State::upd_qdot_of`] beforehand.
    pub fn qdot_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Velocity)?;
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        Ok(Ref::map(self.pool.qdot.borrow(), |v| &v[start..start + len]))
    }

    /// Writable qdot slice for one subsystem; available once that
    /// subsystem has reached `Model`.
    pub fn upd_qdot_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        Ok(RefMut::map(self.pool.qdot.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's qdotdot slice; requires that subsystem at
    /// `Acceleration`.
    pub fn qdotdot_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Acceleration)?;
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        Ok(Ref::map(self.pool.qdotdot.borrow(), |v| &v[start..start + len]))
    }

    /// Writable qdotdot slice for one subsystem.
    pub fn upd_qdotdot_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.q_start_of(sx)?.0 as usize, self.res(sx).nq());
        Ok(RefMut::map(self.pool.qdotdot.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's udot slice; requires that subsystem at
    /// `Acceleration`.
    pub fn udot_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Acceleration)?;
        let (start, len) = (self.u_start_of(sx)?.0 as usize, self.res(sx).nu());
        Ok(Ref::map(self.pool.udot.borrow(), |v| &v[start..start + len]))
    }

    /// Writable udot slice for one subsystem.
    pub fn upd_udot_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.u_start_of(sx)?.0 as usize, self.res(sx).nu());
        Ok(RefMut::map(self.pool.udot.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's zdot slice; requires that subsystem at
    /// `Dynamics`.
    pub fn zdot_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Dynamics)?;
        let (start, len) = (self.z_start_of(sx)?.0 as usize, self.res(sx).nz());
        Ok(Ref::map(self.pool.zdot.borrow(), |v| &v[start..start + len]))
    }

    /// Writable zdot slice for one subsystem.
    pub fn upd_zdot_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.z_start_of(sx)?.0 as usize, self.res(sx).nz());
        Ok(RefMut::map(self.pool.zdot.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    // ── Constraint errors and multipliers ────────────────────────

    /// The position constraint-error cache. Reading requires
    /// `Position`.
    pub fn qerr(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Position)?;
        Ok(Ref::map(self.pool.qerr.borrow(), Vec::as_slice))
    }

    /// Writable qerr cache; available from `Instance`.
    pub fn upd_qerr(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(RefMut::map(self.pool.qerr.borrow_mut(), Vec::as_mut_slice))
    }

    /// The velocity constraint-error cache. Reading requires
    /// `Velocity`.
    pub fn uerr(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Velocity)?;
        Ok(Ref::map(self.pool.uerr.borrow(), Vec::as_slice))
    }

    /// Writable uerr cache; available from `Instance`.
    pub fn upd_uerr(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(RefMut::map(self.pool.uerr.borrow_mut(), Vec::as_mut_slice))
    }

    /// The acceleration constraint-error cache. Reading requires
    /// `Acceleration`.
    pub fn udoterr(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Acceleration)?;
        Ok(Ref::map(self.pool.udoterr.borrow(), Vec::as_slice))
    }

    /// Writable udoterr cache; available from `Instance`.
    pub fn upd_udoterr(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(RefMut::map(self.pool.udoterr.borrow_mut(), Vec::as_mut_slice))
    }

    /// The Lagrange-multiplier cache. Reading requires `Acceleration`.
    pub fn multipliers(&self) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Acceleration)?;
        Ok(Ref::map(self.pool.multipliers.borrow(), Vec::as_slice))
    }

    /// Writable multiplier cache; available from `Instance`.
    pub fn upd_multipliers(&self) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(RefMut::map(
            self.pool.multipliers.borrow_mut(),
            Vec::as_mut_slice,
        ))
    }

    /// Copy the logical yerr view {qerr, uerr} into `out`. Requires
    /// `Velocity`.
    pub fn copy_yerr(&self, out: &mut [f64]) -> Result<(), StateError> {
        self.require_system_stage(Stage::Velocity)?;
        let qerr = self.pool.qerr.borrow();
        let uerr = self.pool.uerr.borrow();
        check_len(ResourceKind::QErr, qerr.len() + uerr.len(), out.len())?;
        out[..qerr.len()].copy_from_slice(&qerr);
        out[qerr.len()..].copy_from_slice(&uerr);
        Ok(())
    }

    /// One subsystem's qerr slice; requires that subsystem at
    /// `Position`.
    pub fn qerr_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Position)?;
        let (start, len) = (self.qerr_start_of(sx)?.0 as usize, self.res(sx).nqerr());
        Ok(Ref::map(self.pool.qerr.borrow(), |v| &v[start..start + len]))
    }

    /// Writable qerr slice for one subsystem; available once that
    /// subsystem has reached `Instance`.
    pub fn upd_qerr_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.qerr_start_of(sx)?.0 as usize, self.res(sx).nqerr());
        Ok(RefMut::map(self.pool.qerr.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's uerr slice; requires that subsystem at
    /// `Velocity`.
    pub fn uerr_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Velocity)?;
        let (start, len) = (self.uerr_start_of(sx)?.0 as usize, self.res(sx).nuerr());
        Ok(Ref::map(self.pool.uerr.borrow(), |v| &v[start..start + len]))
    }

    /// Writable uerr slice for one subsystem.
    pub fn upd_uerr_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.uerr_start_of(sx)?.0 as usize, self.res(sx).nuerr());
        Ok(RefMut::map(self.pool.uerr.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's udoterr slice; requires that subsystem at
    /// `Acceleration`.
    pub fn udoterr_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Acceleration)?;
        let (start, len) = (self.udoterr_start_of(sx)?.0 as usize, self.res(sx).nudoterr());
        Ok(Ref::map(self.pool.udoterr.borrow(), |v| &v[start..start + len]))
    }

    /// Writable udoterr slice for one subsystem.
    pub fn upd_udoterr_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.udoterr_start_of(sx)?.0 as usize, self.res(sx).nudoterr());
        Ok(RefMut::map(self.pool.udoterr.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    /// One subsystem's multiplier slice; requires that subsystem at
    /// `Acceleration`.
    pub fn multipliers_of(&self, sx: SubsystemIndex) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_subsystem_stage(sx, Stage::Acceleration)?;
        let (start, len) = (self.udoterr_start_of(sx)?.0 as usize, self.res(sx).nudoterr());
        Ok(Ref::map(self.pool.multipliers.borrow(), |v| {
            &v[start..start + len]
        }))
    }

    /// Writable multiplier slice for one subsystem.
    pub fn upd_multipliers_of(&self, sx: SubsystemIndex) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = (self.udoterr_start_of(sx)?.0 as usize, self.res(sx).nudoterr());
        Ok(RefMut::map(self.pool.multipliers.borrow_mut(), |v| {
            &mut v[start..start + len]
        }))
    }

    // ── Event triggers ───────────────────────────────────────────

    /// The trigger values evaluated at `stage`. Requires `Instance`.
    pub fn event_triggers_by_stage(&self, stage: Stage) -> Result<Ref<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(Ref::map(
            self.pool.triggers[stage.index()].borrow(),
            Vec::as_slice,
        ))
    }

    /// Writable trigger values for `stage`. Requires `Instance`.
    pub fn upd_event_triggers_by_stage(
        &self,
        stage: Stage,
    ) -> Result<RefMut<'_, [f64]>, StateError> {
        self.require_system_stage(Stage::Instance)?;
        Ok(RefMut::map(
            self.pool.triggers[stage.index()].borrow_mut(),
            Vec::as_mut_slice,
        ))
    }

    /// One subsystem's trigger slice at `stage`; requires that
    /// subsystem at `Instance`.
    pub fn event_triggers_by_stage_of(
        &self,
        sx: SubsystemIndex,
        stage: Stage,
    ) -> Result<Ref<'_, [f64]>, StateError> {
        let (start, len) = self.trigger_slice_of(sx, stage)?;
        Ok(Ref::map(self.pool.triggers[stage.index()].borrow(), |v| {
            &v[start..start + len]
        }))
    }

    /// Writable trigger slice for one subsystem at `stage`.
    pub fn upd_event_triggers_by_stage_of(
        &self,
        sx: SubsystemIndex,
        stage: Stage,
    ) -> Result<RefMut<'_, [f64]>, StateError> {
        let (start, len) = self.trigger_slice_of(sx, stage)?;
        Ok(RefMut::map(
            self.pool.triggers[stage.index()].borrow_mut(),
            |v| &mut v[start..start + len],
        ))
    }

    fn trigger_slice_of(
        &self,
        sx: SubsystemIndex,
        stage: Stage,
    ) -> Result<(usize, usize), StateError> {
        let res = self.res(sx);
        let start = res.trigger_starts[stage.index()]
            .get()
            .ok_or(StateError::StageNotReached {
                required: Stage::Instance,
                current: self.ledger.row(sx).stage(),
            })?;
        Ok((start as usize, res.n_triggers_at(stage)))
    }

    // ── Discrete variables ───────────────────────────────────────

    /// Allocate a discrete variable private to `sx`, taking ownership
    /// of `value`. Legal while the subsystem is at `Empty` or
    /// `Topology`; `invalidates` is the lowest stage a write to the
    /// variable disturbs and must lie above the allocation stage.
    pub fn allocate_discrete_variable(
        &mut self,
        sx: SubsystemIndex,
        invalidates: Stage,
        value: Value,
    ) -> Result<DiscreteVarIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::DiscreteVariable, Stage::Model)?;
        if invalidates <= current {
            return Err(StateError::InvalidatesNotAboveAllocation {
                subsystem: sx,
                invalidates,
                allocation: current,
            });
        }
        let res = self.res_mut(sx);
        let index = DiscreteVarIndex(res.discrete.len() as u32);
        res.discrete.push(DiscreteVar::new(current, invalidates, value));
        Ok(index)
    }

    /// Allocate a discrete variable whose value is replaced from a
    /// paired cache entry at each step boundary.
    ///
    /// `invalidates` must lie above `Time`: an auto-update variable is
    /// swapped between steps, and the swap deliberately invalidates
    /// nothing, which is only sound for quantities that feed stages
    /// computed fresh each step. The paired entry is lazy with
    /// earliest stage `update_depends_on` and holds a clone of
    /// `value` until the first update is computed.
    pub fn allocate_auto_update_discrete_variable(
        &mut self,
        sx: SubsystemIndex,
        invalidates: Stage,
        value: Value,
        update_depends_on: Stage,
    ) -> Result<DiscreteVarIndex, StateError> {
        if invalidates <= Stage::Time {
            return Err(StateError::AutoUpdateInvalidatesTooLow {
                subsystem: sx,
                invalidates,
            });
        }
        let current = self.allocation_stage(sx, ResourceKind::DiscreteVariable, Stage::Model)?;
        let res = self.res_mut(sx);
        let entry = CacheEntryIndex(res.cache.len() as u32);
        res.cache.push(CacheEntry::new(
            current,
            update_depends_on,
            None,
            value.clone(),
        ));
        let index = DiscreteVarIndex(res.discrete.len() as u32);
        res.discrete
            .push(DiscreteVar::new(current, invalidates, value).with_update_entry(entry));
        Ok(index)
    }

    /// The subsystem stage at which a discrete variable was allocated
    /// (`Empty` or `Topology`).
    pub fn discrete_var_allocation_stage(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<Stage, StateError> {
        Ok(self.discrete_ref(sx, dx)?.alloc_stage)
    }

    /// The lowest stage invalidated when a discrete variable is
    /// written.
    pub fn discrete_var_invalidates_stage(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<Stage, StateError> {
        Ok(self.discrete_ref(sx, dx)?.invalidates)
    }

    /// Time of the last write (or auto-update swap) to a discrete
    /// variable; NaN before the first one.
    pub fn discrete_var_last_update_time(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<f64, StateError> {
        Ok(self.discrete_ref(sx, dx)?.last_update_time)
    }

    /// Read a discrete variable. Requires only that it has been
    /// allocated.
    pub fn discrete_variable(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<&Value, StateError> {
        Ok(&self.discrete_ref(sx, dx)?.value)
    }

    /// Writable access to a discrete variable. Invalidates its
    /// declared stage and everything above it for the owning
    /// subsystem, and records the current time as its last update.
    pub fn upd_discrete_variable(
        &mut self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<&mut Value, StateError> {
        let invalidates = self.discrete_ref(sx, dx)?.invalidates;
        if invalidates > Stage::Instance {
            self.backup_subsystem_cache(sx, invalidates);
        } else {
            // Crossing the Instance or Model boundary tears down
            // shared storage, which is inherently system-wide.
            self.invalidate_all(invalidates);
        }
        let time = self.pool.time;
        let dv = &mut self.subsystems[sx.0 as usize].discrete[dx.0 as usize];
        dv.last_update_time = time;
        Ok(&mut dv.value)
    }

    /// Overwrite a discrete variable; equivalent to writing through
    /// [`State::upd_discrete_variable`].
    pub fn set_discrete_variable(
        &mut self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
        value: Value,
    ) -> Result<(), StateError> {
        *self.upd_discrete_variable(sx, dx)? = value;
        Ok(())
    }

    // ── Auto-update protocol ─────────────────────────────────────

    /// The paired update cache entry of an auto-update variable, or
    /// `None` for an ordinary discrete variable.
    pub fn discrete_var_update_index(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<Option<CacheEntryIndex>, StateError> {
        Ok(self.discrete_ref(sx, dx)?.update_entry)
    }

    /// Read the pre-computed next value of an auto-update variable.
    /// Fails if the variable is not auto-update or the update value
    /// has not been realized.
    pub fn discrete_var_update_value(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<Ref<'_, Value>, StateError> {
        let cx = self.update_entry_of(sx, dx)?;
        self.cache_entry(sx, cx)
    }

    /// Writable access to the pre-computed next value. Remember to
    /// mark it realized afterwards or the sweep will skip it.
    pub fn upd_discrete_var_update_value(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<RefMut<'_, Value>, StateError> {
        let cx = self.update_entry_of(sx, dx)?;
        self.upd_cache_entry(sx, cx)
    }

    /// Whether the update value has been computed since the state it
    /// depends on last changed.
    pub fn is_discrete_var_update_value_realized(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<bool, StateError> {
        let cx = self.update_entry_of(sx, dx)?;
        self.is_cache_value_realized(sx, cx)
    }

    /// Mark the update value as computed.
    pub fn mark_discrete_var_update_value_realized(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<(), StateError> {
        let cx = self.update_entry_of(sx, dx)?;
        self.mark_cache_value_realized(sx, cx)
    }

    /// Swap every auto-update discrete variable whose paired cache
    /// entry is realized with that entry's value, then mark the entry
    /// unrealized. Run exactly once per step boundary, after all other
    /// same-step mutations.
    ///
    /// No stage is invalidated by the swap. This is sound only when
    /// computations during realization use the *update* value rather
    /// than the variable value, so that nothing observable changes
    /// across the swap; that structure is the caller's obligation and
    /// is not verified here.
    pub fn auto_update_discrete_variables(&mut self) {
        let time = self.pool.time;
        for res in &mut self.subsystems {
            for i in 0..res.discrete.len() {
                let Some(cx) = res.discrete[i].update_entry else {
                    continue;
                };
                let entry = &res.cache[cx.0 as usize];
                if !entry.realized.get() {
                    continue;
                }
                mem::swap(&mut res.discrete[i].value, &mut *entry.value.borrow_mut());
                entry.realized.set(false);
                res.discrete[i].last_update_time = time;
            }
        }
    }

    // ── Cache entries ────────────────────────────────────────────

    /// Allocate a cache entry private to `sx`, taking ownership of
    /// `value`. Legal while the subsystem is below `Instance`.
    ///
    /// Below `earliest` the value is provably invalid; at or above
    /// `latest` (when given) it is presumed valid without the
    /// explicit flag. Pass `latest = None` for a lazy entry — or use
    /// [`State::allocate_lazy_cache_entry`].
    pub fn allocate_cache_entry(
        &mut self,
        sx: SubsystemIndex,
        earliest: Stage,
        latest: Option<Stage>,
        value: Value,
    ) -> Result<CacheEntryIndex, StateError> {
        let current = self.allocation_stage(sx, ResourceKind::CacheEntry, Stage::Instance)?;
        let res = self.res_mut(sx);
        let index = CacheEntryIndex(res.cache.len() as u32);
        res.cache.push(CacheEntry::new(current, earliest, latest, value));
        Ok(index)
    }

    /// Allocate a lazy cache entry: computable from `earliest` but
    /// never automatically realized, so only explicit marking ever
    /// validates it.
    pub fn allocate_lazy_cache_entry(
        &mut self,
        sx: SubsystemIndex,
        earliest: Stage,
        value: Value,
    ) -> Result<CacheEntryIndex, StateError> {
        self.allocate_cache_entry(sx, earliest, None, value)
    }

    /// The subsystem stage at which a cache entry was allocated
    /// (`Empty`, `Topology`, or `Model`).
    pub fn cache_entry_allocation_stage(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<Stage, StateError> {
        Ok(self.cache_ref(sx, cx)?.alloc_stage)
    }

    /// Read a cache entry. Fails unless the validity predicate holds:
    /// explicitly marked realized, or the owning subsystem has reached
    /// the entry's `latest` stage. No computation is ever triggered by
    /// a read — realize explicitly first.
    pub fn cache_entry(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<Ref<'_, Value>, StateError> {
        let stage = self.ledger.row(sx).stage();
        let entry = self.cache_ref(sx, cx)?;
        if !entry.is_valid(stage) {
            return Err(StateError::CacheNotRealized {
                subsystem: sx,
                index: cx,
            });
        }
        Ok(entry.value.borrow())
    }

    /// Writable access to a cache entry's value, available any time
    /// after allocation through a shared reference. Writing neither
    /// validates nor invalidates the entry — mark it realized
    /// explicitly once computed.
    pub fn upd_cache_entry(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<RefMut<'_, Value>, StateError> {
        Ok(self.cache_ref(sx, cx)?.value.borrow_mut())
    }

    /// Whether a cache entry currently satisfies the validity
    /// predicate. Never changes state.
    pub fn is_cache_value_realized(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<bool, StateError> {
        let stage = self.ledger.row(sx).stage();
        Ok(self.cache_ref(sx, cx)?.is_valid(stage))
    }

    /// Mark a cache entry realized. The owning subsystem must have
    /// reached the entry's `earliest` stage. Idempotent.
    pub fn mark_cache_value_realized(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<(), StateError> {
        let stage = self.ledger.row(sx).stage();
        let entry = self.cache_ref(sx, cx)?;
        if stage < entry.earliest {
            return Err(StateError::MarkBelowEarliest {
                subsystem: sx,
                index: cx,
                earliest: entry.earliest,
                current: stage,
            });
        }
        entry.realized.set(true);
        Ok(())
    }

    /// Explicitly clear a cache entry's realized flag. (It also clears
    /// automatically whenever the subsystem is backed below the
    /// entry's `earliest` stage.)
    pub fn mark_cache_value_not_realized(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<(), StateError> {
        self.cache_ref(sx, cx)?.realized.set(false);
        Ok(())
    }

    // ── Debug dump ───────────────────────────────────────────────

    /// Render a human-readable summary of the cache side: pool sizes
    /// and per-entry validity. No round-trip contract.
    pub fn cache_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "cache: qdot[{}] qdotdot[{}] udot[{}] zdot[{}] qerr[{}] uerr[{}] udoterr[{}] mult[{}]",
            self.pool.qdot.borrow().len(),
            self.pool.qdotdot.borrow().len(),
            self.pool.udot.borrow().len(),
            self.pool.zdot.borrow().len(),
            self.pool.qerr.borrow().len(),
            self.pool.uerr.borrow().len(),
            self.pool.udoterr.borrow().len(),
            self.pool.multipliers.borrow().len(),
        );
        for (sx, res) in self.resources() {
            let stage = self.ledger.row(sx).stage();
            for (i, entry) in res.cache.iter().enumerate() {
                let latest = match entry.latest {
                    Some(stage) => stage.to_string(),
                    None => "never".to_string(),
                };
                let _ = writeln!(
                    out,
                    "  subsystem {sx} entry {i}: earliest {}, latest {}, {}",
                    entry.earliest,
                    latest,
                    if entry.is_valid(stage) { "valid" } else { "not realized" },
                );
            }
        }
        out
    }

    // ── Internal helpers ─────────────────────────────────────────

    fn res(&self, sx: SubsystemIndex) -> &SubsystemResources {
        &self.subsystems[sx.0 as usize]
    }

    fn res_mut(&mut self, sx: SubsystemIndex) -> &mut SubsystemResources {
        &mut self.subsystems[sx.0 as usize]
    }

    fn resources(&self) -> impl Iterator<Item = (SubsystemIndex, &SubsystemResources)> {
        self.subsystems
            .iter()
            .enumerate()
            .map(|(i, res)| (SubsystemIndex(i as u32), res))
    }

    fn require_system_stage(&self, required: Stage) -> Result<(), StateError> {
        let current = self.ledger.system_stage();
        if current < required {
            return Err(StateError::StageNotReached { required, current });
        }
        Ok(())
    }

    fn require_subsystem_stage(
        &self,
        sx: SubsystemIndex,
        required: Stage,
    ) -> Result<(), StateError> {
        let current = self.ledger.row(sx).stage();
        if current < required {
            return Err(StateError::StageNotReached { required, current });
        }
        Ok(())
    }

    /// Check an allocation window and return the stage the allocation
    /// is tagged with.
    fn allocation_stage(
        &self,
        sx: SubsystemIndex,
        kind: ResourceKind,
        cutoff: Stage,
    ) -> Result<Stage, StateError> {
        let current = self.ledger.row(sx).stage();
        if current >= cutoff {
            return Err(StateError::AllocationWindowClosed {
                subsystem: sx,
                kind,
                current,
                cutoff,
            });
        }
        Ok(current)
    }

    fn discrete_ref(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<&DiscreteVar, StateError> {
        self.res(sx)
            .discrete
            .get(dx.0 as usize)
            .ok_or(StateError::UnallocatedResource {
                subsystem: sx,
                kind: ResourceKind::DiscreteVariable,
                index: dx.0,
            })
    }

    fn cache_ref(
        &self,
        sx: SubsystemIndex,
        cx: CacheEntryIndex,
    ) -> Result<&CacheEntry, StateError> {
        self.res(sx)
            .cache
            .get(cx.0 as usize)
            .ok_or(StateError::UnallocatedResource {
                subsystem: sx,
                kind: ResourceKind::CacheEntry,
                index: cx.0,
            })
    }

    fn update_entry_of(
        &self,
        sx: SubsystemIndex,
        dx: DiscreteVarIndex,
    ) -> Result<CacheEntryIndex, StateError> {
        self.discrete_ref(sx, dx)?
            .update_entry
            .ok_or(StateError::NotAutoUpdate {
                subsystem: sx,
                index: dx,
            })
    }

    /// Compact a subsystem's declared q/u/z into the global pools and
    /// size the matching derivative caches.
    fn materialize_model(&mut self, sx: SubsystemIndex) {
        let res = &mut self.subsystems[sx.0 as usize];
        let pool = &mut self.pool;

        res.q_start = Some(SystemQIndex(pool.q.len() as u32));
        for request in &res.q_requests {
            pool.q.extend_from_slice(&request.init);
        }
        res.u_start = Some(SystemUIndex(pool.u.len() as u32));
        for request in &res.u_requests {
            pool.u.extend_from_slice(&request.init);
        }
        res.z_start = Some(SystemZIndex(pool.z.len() as u32));
        for request in &res.z_requests {
            pool.z.extend_from_slice(&request.init);
        }

        pool.qdot.get_mut().resize(pool.q.len(), 0.0);
        pool.qdotdot.get_mut().resize(pool.q.len(), 0.0);
        pool.udot.get_mut().resize(pool.u.len(), 0.0);
        pool.zdot.get_mut().resize(pool.z.len(), 0.0);
    }

    /// Compact a subsystem's error-slot and trigger declarations into
    /// the Instance-stage cache pools.
    fn materialize_instance(&mut self, sx: SubsystemIndex) {
        let res = &mut self.subsystems[sx.0 as usize];
        let pool = &mut self.pool;

        let nqerr = res.nqerr();
        let nuerr = res.nuerr();
        let nudoterr = res.nudoterr();

        let qerr = pool.qerr.get_mut();
        res.qerr_start.set(Some(SystemQErrIndex(qerr.len() as u32)));
        qerr.resize(qerr.len() + nqerr, 0.0);

        let uerr = pool.uerr.get_mut();
        res.uerr_start.set(Some(SystemUErrIndex(uerr.len() as u32)));
        uerr.resize(uerr.len() + nuerr, 0.0);

        let udoterr = pool.udoterr.get_mut();
        res.udoterr_start
            .set(Some(SystemUDotErrIndex(udoterr.len() as u32)));
        udoterr.resize(udoterr.len() + nudoterr, 0.0);
        // Multipliers are partitioned identically to udoterr.
        pool.multipliers.get_mut().resize(udoterr.len(), 0.0);

        for stage in Stage::ALL {
            let bucket = pool.triggers[stage.index()].get_mut();
            res.trigger_starts[stage.index()].set(Some(bucket.len() as u32));
            let count = res.n_triggers_at(stage);
            bucket.resize(bucket.len() + count, 0.0);
        }
    }
}

/// Copy semantics for checkpointing: state variables only, never
/// cache.
///
/// If the source has not reached `Model`, only resources allocated at
/// `Empty` (the Topology-stage variables) are carried over and the
/// copy's stages are capped at `Topology`. Otherwise all state
/// variables are carried, realized flags are cleared, Instance-stage
/// storage is reset, and the copy's stages are capped at `Model`.
/// Stage versions carry over so change detection keeps working across
/// a checkpoint.
impl Clone for State {
    fn clone(&self) -> Self {
        let modeled = self.ledger.system_stage() >= Stage::Model;
        let cap = if modeled { Stage::Model } else { Stage::Topology };

        let ledger = self.ledger.clone();
        ledger.cap_stages(cap);

        let subsystems: Vec<SubsystemResources> = self
            .subsystems
            .iter()
            .map(|res| {
                let mut copy = res.clone();
                copy.clear_instance_offsets();
                for entry in &copy.cache {
                    entry.realized.set(false);
                }
                if !modeled {
                    copy.clear_model_offsets();
                    copy.discard_requests_at_or_above(Stage::Topology);
                }
                copy
            })
            .collect();

        let pool = if modeled {
            let mut pool = self.pool.clone();
            for cache in [&mut pool.qdot, &mut pool.qdotdot, &mut pool.udot, &mut pool.zdot] {
                cache.get_mut().fill(0.0);
            }
            pool.clear_instance_cache();
            pool.qerr_weights.clear();
            pool.uerr_weights.clear();
            pool
        } else {
            SystemPool::new()
        };

        Self {
            ledger,
            subsystems,
            pool,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State (system stage {})", self.ledger.system_stage())?;
        if self.ledger.system_stage() >= Stage::Model {
            writeln!(f, "  t = {}", self.pool.time)?;
            writeln!(f, "  q = {:?}", self.pool.q)?;
            writeln!(f, "  u = {:?}", self.pool.u)?;
            writeln!(f, "  z = {:?}", self.pool.z)?;
        }
        for (sx, row) in self.ledger.rows() {
            let res = self.res(sx);
            writeln!(
                f,
                "  subsystem {sx} '{}' v'{}' @ {}: nq={} nu={} nz={} discrete={} cache={}",
                row.name,
                row.version,
                row.stage(),
                res.nq(),
                res.nu(),
                res.nz(),
                res.discrete.len(),
                res.cache.len(),
            )?;
            for (i, dv) in res.discrete.iter().enumerate() {
                writeln!(
                    f,
                    "    d[{i}] (invalidates {}) = {}",
                    dv.invalidates, dv.value
                )?;
            }
        }
        Ok(())
    }
}

fn check_len(kind: ResourceKind, expected: usize, got: usize) -> Result<(), StateError> {
    if expected != got {
        return Err(StateError::SizeMismatch {
            kind,
            expected,
            got,
        });
    }
    Ok(())
}
