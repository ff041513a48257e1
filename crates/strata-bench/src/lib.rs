//! Benchmark profiles and utilities for the Strata staged-state
//! framework.
//!
//! Provides pre-built container profiles shared by the benches:
//!
//! - [`reference_profile`]: 8 subsystems, 64 q/u per subsystem, with
//!   constraint errors, triggers, and lazy cache entries
//! - [`realize_to`]: drive every subsystem and the system to a stage

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use strata_core::{CacheEntryIndex, Stage, SubsystemIndex, Value};
use strata_state::State;

/// Build a reference container: `subsystems` subsystems, each with
/// `per_pool` q's and u's, a quarter as many z's, constraint errors,
/// one Position-stage trigger, and one lazy cache entry (returned for
/// the cache benches).
pub fn reference_profile(
    subsystems: usize,
    per_pool: usize,
) -> (State, Vec<(SubsystemIndex, CacheEntryIndex)>) {
    let mut state = State::new();
    let mut entries = Vec::with_capacity(subsystems);
    for i in 0..subsystems {
        let sx = state
            .add_subsystem(&format!("subsystem-{i}"), "bench")
            .unwrap();
        state.allocate_q(sx, &vec![0.0; per_pool]).unwrap();
        state.allocate_u(sx, &vec![0.0; per_pool]).unwrap();
        state.allocate_z(sx, &vec![0.0; per_pool / 4]).unwrap();
        state.allocate_qerr(sx, 4).unwrap();
        state.allocate_uerr(sx, 2).unwrap();
        state.allocate_udoterr(sx, 2).unwrap();
        state.allocate_event_trigger(sx, Stage::Position, 1).unwrap();
        let cx = state
            .allocate_lazy_cache_entry(sx, Stage::Position, Value::Real(0.0))
            .unwrap();
        entries.push((sx, cx));
    }
    (state, entries)
}

/// Advance every subsystem and then the system, one stage at a time,
/// until the system reaches `to`.
pub fn realize_to(state: &mut State, to: Stage) {
    loop {
        let current = state.system_stage();
        if current >= to {
            break;
        }
        let target = current.next().expect("cannot realize past Report");
        for i in 0..state.num_subsystems() {
            let sx = SubsystemIndex(i as u32);
            if state.subsystem_stage(sx) < target {
                state.advance_subsystem_to_stage(sx, target).unwrap();
            }
        }
        state.advance_system_to_stage(target).unwrap();
    }
}
