//! Full realization-lifecycle integration tests: two subsystems
//! declare resources, advance through every stage, and the global
//! layout, stage gating, and version bookkeeping are checked at each
//! step.

use strata_state::{QIndex, Stage, State, StateError, SubsystemIndex, UIndex, Value};

// ── Helpers ─────────────────────────────────────────────────────

/// Register two subsystems: "matter" declares 3 q / 2 u / 1 z plus
/// constraint errors, "forces" declares 1 q / 1 u plus a trigger.
fn configured_state() -> (State, SubsystemIndex, SubsystemIndex) {
    let mut state = State::new();
    let matter = state.add_subsystem("matter", "2.1").unwrap();
    let forces = state.add_subsystem("forces", "0.9").unwrap();

    assert_eq!(
        state.allocate_q(matter, &[0.1, 0.2, 0.3]).unwrap(),
        QIndex(0)
    );
    assert_eq!(state.allocate_u(matter, &[1.0, 2.0]).unwrap(), UIndex(0));
    state.allocate_z(matter, &[9.0]).unwrap();
    state.allocate_qerr(matter, 2).unwrap();
    state.allocate_uerr(matter, 1).unwrap();
    state.allocate_udoterr(matter, 1).unwrap();

    state.allocate_q(forces, &[7.0]).unwrap();
    state.allocate_u(forces, &[8.0]).unwrap();
    state
        .allocate_event_trigger(forces, Stage::Position, 2)
        .unwrap();

    (state, matter, forces)
}

fn advance_all(state: &mut State, to: Stage) {
    for target in Stage::ALL {
        if target == Stage::Empty || target > to {
            continue;
        }
        for i in 0..state.num_subsystems() {
            state
                .advance_subsystem_to_stage(SubsystemIndex(i as u32), target)
                .unwrap();
        }
        state.advance_system_to_stage(target).unwrap();
    }
}

// ── Staging order ───────────────────────────────────────────────

#[test]
fn advance_reports_the_reached_stage() {
    let (mut state, matter, _) = configured_state();
    state
        .advance_subsystem_to_stage(matter, Stage::Topology)
        .unwrap();
    assert_eq!(state.subsystem_stage(matter), Stage::Topology);
}

#[test]
fn skipping_a_stage_is_an_ordering_error() {
    let (mut state, matter, _) = configured_state();
    state
        .advance_subsystem_to_stage(matter, Stage::Topology)
        .unwrap();
    let err = state
        .advance_subsystem_to_stage(matter, Stage::Instance)
        .unwrap_err();
    assert!(matches!(err, StateError::StageOutOfOrder { .. }));
}

#[test]
fn system_advance_names_the_laggard() {
    let (mut state, matter, forces) = configured_state();
    state
        .advance_subsystem_to_stage(matter, Stage::Topology)
        .unwrap();
    let err = state.advance_system_to_stage(Stage::Topology).unwrap_err();
    match err {
        StateError::SystemAdvanceBlocked {
            subsystem,
            subsystem_stage,
            ..
        } => {
            assert_eq!(subsystem, forces);
            assert_eq!(subsystem_stage, Stage::Empty);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn system_stage_never_exceeds_subsystem_minimum() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Velocity);
    state.invalidate_all(Stage::Position);
    assert_eq!(state.system_stage(), Stage::Time);
    for i in 0..state.num_subsystems() {
        assert!(state.subsystem_stage(SubsystemIndex(i as u32)) >= state.system_stage());
    }
}

// ── Global layout at Model ──────────────────────────────────────

#[test]
fn model_compaction_is_exact_and_subsystem_contiguous() {
    let (mut state, matter, forces) = configured_state();
    advance_all(&mut state, Stage::Model);

    // matter declared 3 q and 2 u; forces declared 1 of each.
    assert_eq!(state.nq(), 4);
    assert_eq!(state.nu(), 3);
    assert_eq!(state.nz(), 1);
    assert_eq!(state.ny(), 8);

    // Local indices start at 0 regardless of registration order.
    assert_eq!(state.nq_of(matter), 3);
    assert_eq!(state.q_start_of(matter).unwrap().0, 0);
    assert_eq!(state.q_start_of(forces).unwrap().0, 3);

    // Initial values landed in declaration order.
    assert_eq!(state.q().unwrap(), &[0.1, 0.2, 0.3, 7.0]);
    assert_eq!(state.q_of(forces).unwrap(), &[7.0]);
    assert_eq!(state.u_of(matter).unwrap(), &[1.0, 2.0]);

    // Derivative caches sized alongside.
    assert_eq!(state.upd_qdot().unwrap().len(), 4);
    assert_eq!(state.upd_qdotdot().unwrap().len(), 4);
    assert_eq!(state.upd_udot().unwrap().len(), 3);
    assert_eq!(state.upd_zdot().unwrap().len(), 1);
}

#[test]
fn y_view_concatenates_q_u_z() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Model);

    assert_eq!(state.q_start().0, 0);
    assert_eq!(state.u_start().0, 4);
    assert_eq!(state.z_start().0, 7);

    let mut y = vec![0.0; state.ny()];
    state.copy_y(&mut y).unwrap();
    assert_eq!(y, vec![0.1, 0.2, 0.3, 7.0, 1.0, 2.0, 8.0, 9.0]);

    let doubled: Vec<f64> = y.iter().map(|v| v * 2.0).collect();
    state.set_y(&doubled).unwrap();
    assert_eq!(state.z().unwrap(), &[18.0]);
    // Writing y disturbs Position; the system was only at Model, so
    // nothing backs up.
    assert_eq!(state.system_stage(), Stage::Model);
}

// ── Instance layout ─────────────────────────────────────────────

#[test]
fn instance_compaction_sizes_error_pools_and_triggers() {
    let (mut state, matter, forces) = configured_state();
    advance_all(&mut state, Stage::Instance);

    assert_eq!(state.nqerr(), 2);
    assert_eq!(state.nuerr(), 1);
    assert_eq!(state.nyerr(), 3);
    assert_eq!(state.nudoterr(), 1);
    assert_eq!(state.n_multipliers(), 1);

    assert_eq!(state.qerr_start_of(matter).unwrap().0, 0);
    assert_eq!(state.upd_qerr().unwrap().len(), 2);
    assert_eq!(state.upd_multipliers().unwrap().len(), 1);

    assert_eq!(state.n_event_triggers(), 2);
    assert_eq!(state.n_event_triggers_by_stage(Stage::Position), 2);
    assert_eq!(state.n_event_triggers_by_stage(Stage::Velocity), 0);
    assert_eq!(
        state
            .event_triggers_by_stage_of(forces, Stage::Position)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn trigger_layout_is_stage_major() {
    let mut state = State::new();
    let a = state.add_subsystem("a", "1").unwrap();
    let b = state.add_subsystem("b", "1").unwrap();
    state.allocate_event_trigger(a, Stage::Velocity, 1).unwrap();
    state.allocate_event_trigger(b, Stage::Position, 2).unwrap();
    state.allocate_event_trigger(a, Stage::Position, 1).unwrap();
    advance_all(&mut state, Stage::Instance);

    // Position triggers (3 total) precede Velocity triggers (1).
    assert_eq!(state.event_trigger_start_by_stage(Stage::Position).0, 0);
    assert_eq!(state.event_trigger_start_by_stage(Stage::Velocity).0, 3);
    assert_eq!(state.n_event_triggers(), 4);

    // Within a stage, subsystems are contiguous in advance order.
    assert_eq!(
        state
            .event_triggers_by_stage_of(a, Stage::Position)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        state
            .event_triggers_by_stage_of(b, Stage::Position)
            .unwrap()
            .len(),
        2
    );
}

// ── Stage gating ────────────────────────────────────────────────

#[test]
fn cache_reads_are_gated_by_stage() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Position);

    // qdot requires Velocity; qerr only Position.
    assert!(matches!(
        state.qdot(),
        Err(StateError::StageNotReached {
            required: Stage::Velocity,
            ..
        })
    ));
    assert!(state.qerr().is_ok());

    advance_all_from(&mut state, Stage::Velocity);
    assert!(state.qdot().is_ok());
    assert!(matches!(
        state.udot(),
        Err(StateError::StageNotReached {
            required: Stage::Acceleration,
            ..
        })
    ));
}

/// Advance every subsystem and the system from the current stage up
/// to `to`, one stage at a time.
fn advance_all_from(state: &mut State, to: Stage) {
    loop {
        let current = state.system_stage();
        if current >= to {
            break;
        }
        let target = current.next().unwrap();
        for i in 0..state.num_subsystems() {
            let sx = SubsystemIndex(i as u32);
            if state.subsystem_stage(sx) < target {
                state.advance_subsystem_to_stage(sx, target).unwrap();
            }
        }
        state.advance_system_to_stage(target).unwrap();
    }
}

#[test]
fn realization_routines_fill_cache_through_shared_access() {
    let (mut state, matter, _) = configured_state();
    advance_all(&mut state, Stage::Position);

    // A velocity-stage realization routine: subsystems write their
    // qdot slices through &State, then the driver advances stages.
    {
        let shared: &State = &state;
        shared.upd_qdot_of(matter).unwrap().fill(0.5);
    }
    advance_all_from(&mut state, Stage::Velocity);
    assert_eq!(state.qdot_of(matter).unwrap().as_ref(), &[0.5, 0.5, 0.5]);
}

// ── Invalidation ────────────────────────────────────────────────

#[test]
fn invalidate_all_backs_up_and_deallocates() {
    let (mut state, matter, _) = configured_state();
    advance_all(&mut state, Stage::Report);

    state.invalidate_all(Stage::Model);
    assert_eq!(state.system_stage(), Stage::Topology);
    // Values are lost; declarations survive.
    assert!(state.q().is_err());
    assert_eq!(state.nq_of(matter), 3);

    // Re-realizing rebuilds the pools from the declared initials.
    advance_all_from(&mut state, Stage::Model);
    assert_eq!(state.q().unwrap(), &[0.1, 0.2, 0.3, 7.0]);
}

#[test]
fn shared_access_invalidation_is_limited_to_instance_and_above() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Report);

    assert!(matches!(
        state.invalidate_all_cache_at_or_above(Stage::Model),
        Err(StateError::InvalidateTooLow { .. })
    ));

    state
        .invalidate_all_cache_at_or_above(Stage::Instance)
        .unwrap();
    assert_eq!(state.system_stage(), Stage::Model);
    // State variables survived the cache-only invalidation.
    assert_eq!(state.q().unwrap(), &[0.1, 0.2, 0.3, 7.0]);
    // Instance-level cache was torn down and rebuilds on re-advance.
    advance_all_from(&mut state, Stage::Instance);
    assert_eq!(state.upd_qerr().unwrap().len(), 2);
}

// ── Version snapshots ───────────────────────────────────────────

#[test]
fn version_diff_pinpoints_the_disturbed_stage() {
    let (mut state, matter, _) = configured_state();
    // A discrete variable whose writes disturb Position.
    let dx = state
        .allocate_discrete_variable(matter, Stage::Position, Value::Real(0.0))
        .unwrap();
    advance_all(&mut state, Stage::Report);

    let snapshot = state.system_stage_versions();
    assert_eq!(state.lowest_system_stage_difference(&snapshot), None);

    // An opaque operation writes the variable and re-realizes the
    // stages it disturbed; the diff still reports Position.
    state
        .set_discrete_variable(matter, dx, Value::Real(1.0))
        .unwrap();
    advance_all_from(&mut state, Stage::Report);

    assert_eq!(
        state.lowest_system_stage_difference(&snapshot),
        Some(Stage::Position)
    );
}

#[test]
fn untouched_state_diffs_as_unchanged() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Time);
    let snapshot = state.system_stage_versions();

    // Realizing further stages is not a disturbance.
    advance_all_from(&mut state, Stage::Acceleration);
    assert_eq!(state.lowest_system_stage_difference(&snapshot), None);
}

#[test]
fn topology_version_gates_compatibility() {
    let (mut state, _, _) = configured_state();
    advance_all(&mut state, Stage::Topology);

    let version = state.system_topology_stage_version();
    assert!(state.require_topology_stage_version(version).is_ok());
    assert!(matches!(
        state.require_topology_stage_version(version + 1),
        Err(StateError::TopologyVersionMismatch { .. })
    ));
}
