//! Resource pool: per-subsystem allocation requests and the global
//! storage they compact into.
//!
//! Allocation is two-phase. During the configuration window a
//! subsystem *declares* resources, receiving subsystem-local indices
//! immediately; the declarations are recorded here as requests tagged
//! with the stage at which they were made. When the subsystem advances
//! past the relevant cutoff stage the requests are compacted into the
//! global pools and the subsystem's slice offsets are assigned. Backing
//! a subsystem below a cutoff tears the global storage down but keeps
//! the requests, so re-advancing rebuilds the pools from the recorded
//! initial values; backing below a request's own allocation stage
//! discards the request itself.
//!
//! Storage splits along the state/cache line: state-variable pools are
//! plain vectors, mutated only through exclusive access, while cache
//! pools sit in `RefCell` so they can be filled through a shared
//! reference during realization.

use std::cell::{Cell, RefCell};

use strata_core::{
    Stage, SystemQErrIndex, SystemQIndex, SystemUDotErrIndex, SystemUErrIndex, SystemUIndex,
    SystemZIndex,
};

use crate::cache::CacheEntry;
use crate::discrete::DiscreteVar;

/// A continuous-variable declaration: the initial values to plant in
/// the global pool, tagged with the subsystem stage at declaration.
#[derive(Clone, Debug)]
pub(crate) struct ContinuousRequest {
    pub(crate) alloc_stage: Stage,
    pub(crate) init: Vec<f64>,
}

/// A constraint-error-slot declaration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CountRequest {
    pub(crate) alloc_stage: Stage,
    pub(crate) count: u32,
}

/// An event-trigger declaration: `count` witness slots evaluated at
/// `stage`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TriggerRequest {
    pub(crate) alloc_stage: Stage,
    pub(crate) stage: Stage,
    pub(crate) count: u32,
}

/// Everything one subsystem has declared, plus where its slices landed
/// in the global pools once compacted.
///
/// Request lists stay sorted by allocation stage because the windows
/// close monotonically, so deallocation on a downward stage transition
/// is a truncation from the tail.
#[derive(Debug, Default)]
pub(crate) struct SubsystemResources {
    pub(crate) q_requests: Vec<ContinuousRequest>,
    pub(crate) u_requests: Vec<ContinuousRequest>,
    pub(crate) z_requests: Vec<ContinuousRequest>,

    // Error-slot and trigger declarations are cache allocations and
    // arrive through a shared reference.
    pub(crate) qerr_requests: RefCell<Vec<CountRequest>>,
    pub(crate) uerr_requests: RefCell<Vec<CountRequest>>,
    pub(crate) udoterr_requests: RefCell<Vec<CountRequest>>,
    pub(crate) trigger_requests: RefCell<Vec<TriggerRequest>>,

    pub(crate) discrete: Vec<DiscreteVar>,
    pub(crate) cache: Vec<CacheEntry>,

    // Assigned when the subsystem advances to Model.
    pub(crate) q_start: Option<SystemQIndex>,
    pub(crate) u_start: Option<SystemUIndex>,
    pub(crate) z_start: Option<SystemZIndex>,

    // Assigned when the subsystem advances to Instance; cleared through
    // a shared reference on cache invalidation, hence `Cell`.
    pub(crate) qerr_start: Cell<Option<SystemQErrIndex>>,
    pub(crate) uerr_start: Cell<Option<SystemUErrIndex>>,
    pub(crate) udoterr_start: Cell<Option<SystemUDotErrIndex>>,
    /// Offset of this subsystem's triggers within each stage's array.
    pub(crate) trigger_starts: [Cell<Option<u32>>; Stage::COUNT],
}

impl SubsystemResources {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn nq(&self) -> usize {
        self.q_requests.iter().map(|r| r.init.len()).sum()
    }

    pub(crate) fn nu(&self) -> usize {
        self.u_requests.iter().map(|r| r.init.len()).sum()
    }

    pub(crate) fn nz(&self) -> usize {
        self.z_requests.iter().map(|r| r.init.len()).sum()
    }

    pub(crate) fn nqerr(&self) -> usize {
        self.qerr_requests.borrow().iter().map(|r| r.count as usize).sum()
    }

    pub(crate) fn nuerr(&self) -> usize {
        self.uerr_requests.borrow().iter().map(|r| r.count as usize).sum()
    }

    pub(crate) fn nudoterr(&self) -> usize {
        self.udoterr_requests.borrow().iter().map(|r| r.count as usize).sum()
    }

    pub(crate) fn n_triggers_at(&self, stage: Stage) -> usize {
        self.trigger_requests
            .borrow()
            .iter()
            .filter(|r| r.stage == stage)
            .map(|r| r.count as usize)
            .sum()
    }

    /// Drop every declaration made at or above `stage`. Requests are
    /// stage-sorted, so this pops from the tail.
    pub(crate) fn discard_requests_at_or_above(&mut self, stage: Stage) {
        truncate_by_stage(&mut self.q_requests, stage, |r| r.alloc_stage);
        truncate_by_stage(&mut self.u_requests, stage, |r| r.alloc_stage);
        truncate_by_stage(&mut self.z_requests, stage, |r| r.alloc_stage);
        truncate_by_stage(self.qerr_requests.get_mut(), stage, |r| r.alloc_stage);
        truncate_by_stage(self.uerr_requests.get_mut(), stage, |r| r.alloc_stage);
        truncate_by_stage(self.udoterr_requests.get_mut(), stage, |r| r.alloc_stage);
        truncate_by_stage(self.trigger_requests.get_mut(), stage, |r| r.alloc_stage);
        truncate_by_stage(&mut self.discrete, stage, |d| d.alloc_stage);
        truncate_by_stage(&mut self.cache, stage, |c| c.alloc_stage);
    }

    /// Clear the realized flag of every cache entry whose earliest
    /// stage is at or above `stage`. Shared-access safe.
    pub(crate) fn clear_realized_at_or_above(&self, stage: Stage) {
        for entry in &self.cache {
            if entry.earliest >= stage {
                entry.realized.set(false);
            }
        }
    }

    pub(crate) fn clear_model_offsets(&mut self) {
        self.q_start = None;
        self.u_start = None;
        self.z_start = None;
    }

    pub(crate) fn clear_instance_offsets(&self) {
        self.qerr_start.set(None);
        self.uerr_start.set(None);
        self.udoterr_start.set(None);
        for start in &self.trigger_starts {
            start.set(None);
        }
    }
}

impl Clone for SubsystemResources {
    fn clone(&self) -> Self {
        Self {
            q_requests: self.q_requests.clone(),
            u_requests: self.u_requests.clone(),
            z_requests: self.z_requests.clone(),
            qerr_requests: self.qerr_requests.clone(),
            uerr_requests: self.uerr_requests.clone(),
            udoterr_requests: self.udoterr_requests.clone(),
            trigger_requests: self.trigger_requests.clone(),
            discrete: self.discrete.clone(),
            cache: self.cache.clone(),
            q_start: self.q_start,
            u_start: self.u_start,
            z_start: self.z_start,
            qerr_start: self.qerr_start.clone(),
            uerr_start: self.uerr_start.clone(),
            udoterr_start: self.udoterr_start.clone(),
            trigger_starts: std::array::from_fn(|i| self.trigger_starts[i].clone()),
        }
    }
}

fn truncate_by_stage<T>(items: &mut Vec<T>, stage: Stage, alloc_stage: impl Fn(&T) -> Stage) {
    while items.last().map_or(false, |item| alloc_stage(item) >= stage) {
        items.pop();
    }
}

/// The global storage pools.
///
/// The y view {q, u, z} and the yerr view {qerr, uerr} are logical:
/// the component arrays are independent allocations and the façade
/// exposes concatenated offsets and copy operations instead of one
/// backing buffer. Subsystem slices within each component array are
/// contiguous.
#[derive(Debug)]
pub(crate) struct SystemPool {
    // State variables — exclusive-access only.
    pub(crate) q: Vec<f64>,
    pub(crate) u: Vec<f64>,
    pub(crate) z: Vec<f64>,
    pub(crate) time: f64,
    pub(crate) u_weights: Vec<f64>,
    pub(crate) z_weights: Vec<f64>,
    pub(crate) qerr_weights: Vec<f64>,
    pub(crate) uerr_weights: Vec<f64>,

    // Cache — fillable through a shared reference.
    pub(crate) qdot: RefCell<Vec<f64>>,
    pub(crate) qdotdot: RefCell<Vec<f64>>,
    pub(crate) udot: RefCell<Vec<f64>>,
    pub(crate) zdot: RefCell<Vec<f64>>,
    pub(crate) qerr: RefCell<Vec<f64>>,
    pub(crate) uerr: RefCell<Vec<f64>>,
    pub(crate) udoterr: RefCell<Vec<f64>>,
    pub(crate) multipliers: RefCell<Vec<f64>>,
    /// Event-trigger values, one array per evaluation stage.
    pub(crate) triggers: [RefCell<Vec<f64>>; Stage::COUNT],
}

impl SystemPool {
    pub(crate) fn new() -> Self {
        Self {
            q: Vec::new(),
            u: Vec::new(),
            z: Vec::new(),
            time: f64::NAN,
            u_weights: Vec::new(),
            z_weights: Vec::new(),
            qerr_weights: Vec::new(),
            uerr_weights: Vec::new(),
            qdot: RefCell::new(Vec::new()),
            qdotdot: RefCell::new(Vec::new()),
            udot: RefCell::new(Vec::new()),
            zdot: RefCell::new(Vec::new()),
            qerr: RefCell::new(Vec::new()),
            uerr: RefCell::new(Vec::new()),
            udoterr: RefCell::new(Vec::new()),
            multipliers: RefCell::new(Vec::new()),
            triggers: std::array::from_fn(|_| RefCell::new(Vec::new())),
        }
    }

    /// Tear down everything materialized at Model stage. Values are
    /// lost; declarations survive in the subsystem records.
    pub(crate) fn clear_model_storage(&mut self) {
        self.q.clear();
        self.u.clear();
        self.z.clear();
        self.time = f64::NAN;
        self.u_weights.clear();
        self.z_weights.clear();
        self.qdot.get_mut().clear();
        self.qdotdot.get_mut().clear();
        self.udot.get_mut().clear();
        self.zdot.get_mut().clear();
    }

    /// Tear down the cache storage materialized at Instance stage.
    /// Shared-access safe; the weight arrays are state variables and
    /// are reset at the next Instance advance instead.
    pub(crate) fn clear_instance_cache(&self) {
        self.qerr.borrow_mut().clear();
        self.uerr.borrow_mut().clear();
        self.udoterr.borrow_mut().clear();
        self.multipliers.borrow_mut().clear();
        for bucket in &self.triggers {
            bucket.borrow_mut().clear();
        }
    }
}

impl Clone for SystemPool {
    fn clone(&self) -> Self {
        Self {
            q: self.q.clone(),
            u: self.u.clone(),
            z: self.z.clone(),
            time: self.time,
            u_weights: self.u_weights.clone(),
            z_weights: self.z_weights.clone(),
            qerr_weights: self.qerr_weights.clone(),
            uerr_weights: self.uerr_weights.clone(),
            qdot: self.qdot.clone(),
            qdotdot: self.qdotdot.clone(),
            udot: self.udot.clone(),
            zdot: self.zdot.clone(),
            qerr: self.qerr.clone(),
            uerr: self.uerr.clone(),
            udoterr: self.udoterr.clone(),
            multipliers: self.multipliers.clone(),
            triggers: std::array::from_fn(|i| self.triggers[i].clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continuous(stage: Stage, len: usize) -> ContinuousRequest {
        ContinuousRequest {
            alloc_stage: stage,
            init: vec![0.0; len],
        }
    }

    #[test]
    fn counts_sum_over_requests() {
        let mut res = SubsystemResources::new();
        res.q_requests.push(continuous(Stage::Empty, 3));
        res.q_requests.push(continuous(Stage::Topology, 2));
        assert_eq!(res.nq(), 5);
        assert_eq!(res.nu(), 0);
    }

    #[test]
    fn discard_truncates_from_the_tail() {
        let mut res = SubsystemResources::new();
        res.q_requests.push(continuous(Stage::Empty, 3));
        res.q_requests.push(continuous(Stage::Topology, 2));
        res.discard_requests_at_or_above(Stage::Topology);
        assert_eq!(res.nq(), 3);
        res.discard_requests_at_or_above(Stage::Empty);
        assert_eq!(res.nq(), 0);
    }

    #[test]
    fn trigger_counts_group_by_stage() {
        let res = SubsystemResources::new();
        res.trigger_requests.borrow_mut().push(TriggerRequest {
            alloc_stage: Stage::Topology,
            stage: Stage::Position,
            count: 2,
        });
        res.trigger_requests.borrow_mut().push(TriggerRequest {
            alloc_stage: Stage::Topology,
            stage: Stage::Velocity,
            count: 1,
        });
        assert_eq!(res.n_triggers_at(Stage::Position), 2);
        assert_eq!(res.n_triggers_at(Stage::Velocity), 1);
        assert_eq!(res.n_triggers_at(Stage::Acceleration), 0);
    }

    #[test]
    fn clear_model_storage_keeps_instance_weights() {
        let mut pool = SystemPool::new();
        pool.q = vec![1.0, 2.0];
        pool.time = 4.5;
        pool.qerr_weights = vec![1.0];
        pool.clear_model_storage();
        assert!(pool.q.is_empty());
        assert!(pool.time.is_nan());
        assert_eq!(pool.qerr_weights, vec![1.0]);
    }

    #[test]
    fn clear_instance_cache_is_shared_access() {
        let pool = SystemPool::new();
        pool.qerr.borrow_mut().extend([0.0; 4]);
        pool.triggers[Stage::Position.index()]
            .borrow_mut()
            .extend([0.0; 2]);
        pool.clear_instance_cache();
        assert!(pool.qerr.borrow().is_empty());
        assert!(pool.triggers[Stage::Position.index()].borrow().is_empty());
    }
}
