//! Coordinator-level invariants: fault latching, error clearing,
//! per-feeder exclusivity, concurrent feeders, status snapshots.

use std::sync::Arc;

use oams_core::mocks::MockHost;
use oams_core::{
    AmsError, CommandReply, Coordinator, FeederCfg, FpsCfg, LoadState, TicketState,
};
use oams_hardware::{SimCommand, SimulatedFeeder};
use oams_traits::TickClock;

fn two_feeder_rig() -> (
    Coordinator,
    SimulatedFeeder,
    SimulatedFeeder,
    Arc<MockHost>,
    TickClock,
) {
    let sim0 = SimulatedFeeder::new();
    let sim1 = SimulatedFeeder::new();
    let host = Arc::new(MockHost::new());
    let clock = TickClock::new();
    let coordinator = Coordinator::builder()
        .with_clock(Arc::new(clock.clone()))
        .with_host(host.clone())
        .add_feeder("ams0", FeederCfg::default(), Box::new(sim0.clone()))
        .add_feeder("ams1", FeederCfg::default(), Box::new(sim1.clone()))
        .add_fps(
            "fps0",
            FpsCfg {
                pin: "PA1".into(),
                extruder: "extruder".into(),
                feeders: vec!["ams0".into()],
            },
        )
        .add_fps(
            "fps1",
            FpsCfg {
                pin: "PA2".into(),
                extruder: "extruder1".into(),
                feeders: vec!["ams1".into()],
            },
        )
        .add_group("T0", vec![("ams0".into(), 0)])
        .add_group("T1", vec![("ams1".into(), 0)])
        .build()
        .expect("build coordinator");
    (coordinator, sim0, sim1, host, clock)
}

fn tick_all(
    coordinator: &mut Coordinator,
    sims: &[&SimulatedFeeder],
    clock: &TickClock,
) {
    clock.tick();
    for sim in sims {
        sim.push_telemetry();
    }
    coordinator.tick();
}

#[test]
fn faulted_feeder_rejects_commands_until_cleared() {
    let (mut coord, sim0, sim1, _host, clock) = two_feeder_rig();
    sim0.set_filament(0, true);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    // Kill the link: the poll failure latches the fault.
    sim0.set_offline(true);
    tick_all(&mut coord, &[&sim1], &clock);

    match coord.load_spool("fps0", Some("T0")) {
        Err(AmsError::FeederFaulted { feeder }) => assert_eq!(feeder, "ams0"),
        other => panic!("expected FeederFaulted, got {other:?}"),
    }

    // Link restored: OAMS_CLEAR_ERRORS re-queries and lifts the bar.
    sim0.set_offline(false);
    match coord.run_command("OAMS_CLEAR_ERRORS") {
        Ok(CommandReply::Done(msg)) => assert_eq!(msg, "OK"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(sim0.commands().contains(&SimCommand::Query));
    assert!(sim0.commands().contains(&SimCommand::Led { bay: 0, on: false }));

    sim0.push_telemetry();
    tick_all(&mut coord, &[&sim0, &sim1], &clock);
    coord
        .load_spool("fps0", Some("T0"))
        .expect("commands accepted again after re-sync");
}

#[test]
fn clear_errors_fails_while_the_link_is_down() {
    let (mut coord, sim0, sim1, _host, clock) = two_feeder_rig();
    sim0.set_filament(0, true);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    sim0.set_offline(true);
    tick_all(&mut coord, &[&sim1], &clock);

    match coord.clear_errors() {
        Err(AmsError::McuComm { feeder, .. }) => assert_eq!(feeder, "ams0"),
        other => panic!("expected McuComm, got {other:?}"),
    }
    // Still barred.
    assert!(matches!(
        coord.load_spool("fps0", Some("T0")),
        Err(AmsError::FeederFaulted { .. })
    ));
}

#[test]
fn distinct_feeders_run_operations_concurrently() {
    let (mut coord, sim0, sim1, _host, clock) = two_feeder_rig();
    sim0.set_filament(0, true);
    sim1.set_filament(0, true);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    let t0 = coord.load_spool("fps0", Some("T0")).expect("load ams0");
    let t1 = coord.load_spool("fps1", Some("T1")).expect("load ams1");
    assert_eq!(coord.ticket_state(t0), Some(TicketState::Pending));
    assert_eq!(coord.ticket_state(t1), Some(TicketState::Pending));

    sim0.set_pressure(0.8);
    sim0.complete_load(0);
    sim1.set_pressure(0.8);
    sim1.complete_load(0);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    assert_eq!(coord.ticket_state(t0), Some(TicketState::Done(Ok(()))));
    assert_eq!(coord.ticket_state(t1), Some(TicketState::Done(Ok(()))));
    assert_eq!(coord.fps_state("fps0"), Some(LoadState::Loaded));
    assert_eq!(coord.fps_state("fps1"), Some(LoadState::Loaded));
}

#[test]
fn calibration_commands_pass_through_to_the_mcu() {
    let (mut coord, sim0, sim1, _host, clock) = two_feeder_rig();
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    match coord.run_command("OAMS_CALIBRATE_HUB_HES FEEDER=ams0 SPOOL=2") {
        Ok(CommandReply::Done(msg)) => assert_eq!(msg, "OK"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(sim0.commands().contains(&SimCommand::CalibrateHub(2)));

    match coord.run_command("OAMS_CALIBRATE_PTFE FEEDER=ams1 SPOOL=0") {
        Ok(CommandReply::Done(msg)) => assert_eq!(msg, "OK"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(sim1.commands().contains(&SimCommand::CalibratePtfe(0)));

    assert!(matches!(
        coord.run_command("OAMS_CALIBRATE_HUB_HES FEEDER=nope SPOOL=0"),
        Err(AmsError::UnknownName { kind: "feeder", .. })
    ));
}

#[test]
fn set_runout_validates_group_names() {
    let (mut coord, _sim0, _sim1, _host, _clock) = two_feeder_rig();
    match coord.run_command("SET_RUNOUT LANE=T0 RUNOUT=T1") {
        Ok(CommandReply::Done(msg)) => assert_eq!(msg, "OK"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(matches!(
        coord.run_command("SET_RUNOUT LANE=T0 RUNOUT=T9"),
        Err(AmsError::UnknownName { kind: "group", .. })
    ));
}

#[test]
fn status_reflects_the_system_without_mutating_it() {
    let (mut coord, sim0, sim1, _host, clock) = two_feeder_rig();
    sim0.set_filament(0, true);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);

    let before = coord.status();
    assert_eq!(before.feeders.len(), 2);
    assert_eq!(before.fps.len(), 2);
    assert_eq!(before.groups.len(), 2);
    let t0 = before.groups.iter().find(|g| g.name == "T0").expect("T0");
    assert_eq!(t0.available, vec![("ams0".to_string(), 0)]);
    assert!(t0.loaded.is_none());

    // A second read returns the same picture.
    let after = coord.status();
    assert_eq!(after.groups.iter().find(|g| g.name == "T0").expect("T0").available, t0.available);
    assert_eq!(coord.fps_state("fps0"), Some(LoadState::Unloaded));

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    sim0.set_pressure(0.8);
    sim0.complete_load(0);
    tick_all(&mut coord, &[&sim0, &sim1], &clock);
    assert_eq!(coord.ticket_state(ticket), Some(TicketState::Done(Ok(()))));

    let loaded = coord.status();
    let fps0 = loaded.fps.iter().find(|f| f.name == "fps0").expect("fps0");
    assert_eq!(fps0.state, LoadState::Loaded);
    assert_eq!(fps0.feeder.as_deref(), Some("ams0"));
    assert_eq!(fps0.bay, Some(0));
    let t0 = loaded.groups.iter().find(|g| g.name == "T0").expect("T0");
    assert_eq!(t0.loaded, Some(("ams0".to_string(), 0)));
}
