//! Watchdog, retry/backoff, timeout and cancellation behavior.

use std::sync::Arc;

use oams_core::mocks::MockHost;
use oams_core::{
    AmsError, Coordinator, FailReason, FeederCfg, FpsCfg, LoadState, TicketState,
};
use oams_hardware::{SimCommand, SimulatedFeeder};
use oams_traits::TickClock;

fn rig_with(cfg: FeederCfg) -> (Coordinator, SimulatedFeeder, Arc<MockHost>, TickClock) {
    let sim = SimulatedFeeder::new();
    let host = Arc::new(MockHost::new());
    let clock = TickClock::new();
    let coordinator = Coordinator::builder()
        .with_clock(Arc::new(clock.clone()))
        .with_host(host.clone())
        .add_feeder("ams0", cfg, Box::new(sim.clone()))
        .add_fps(
            "fps0",
            FpsCfg {
                pin: "PA1".into(),
                extruder: "extruder".into(),
                feeders: vec!["ams0".into()],
            },
        )
        .add_group("T0", vec![("ams0".into(), 1)])
        .build()
        .expect("build coordinator");
    (coordinator, sim, host, clock)
}

fn tick(coordinator: &mut Coordinator, sim: &SimulatedFeeder, clock: &TickClock) {
    clock.tick();
    sim.push_telemetry();
    coordinator.tick();
}

fn load_commands(sim: &SimulatedFeeder) -> usize {
    sim.commands()
        .iter()
        .filter(|c| matches!(c, SimCommand::Load(_)))
        .count()
}

#[test]
fn stuck_first_attempt_retries_once_and_succeeds() {
    let (mut coord, sim, host, clock) = rig_with(FeederCfg::default());
    sim.set_filament(1, true);
    tick(&mut coord, &sim, &clock);

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    // First attempt: the encoder never moves for over a second.
    for _ in 0..5 {
        tick(&mut coord, &sim, &clock);
    }
    assert!(
        sim.commands().contains(&SimCommand::Stop),
        "stuck attempt must stop the feeder"
    );
    assert_eq!(load_commands(&sim), 1);

    // Cleanup observes STOPPED, then a 1 s backoff before the retry.
    for _ in 0..5 {
        tick(&mut coord, &sim, &clock);
    }
    assert_eq!(load_commands(&sim), 2, "exactly one retry expected");
    assert_eq!(coord.ticket_state(ticket), Some(TicketState::Pending));

    // Second attempt succeeds.
    sim.add_encoder(120);
    sim.set_pressure(0.8);
    sim.complete_load(1);
    tick(&mut coord, &sim, &clock);

    assert_eq!(coord.ticket_state(ticket), Some(TicketState::Done(Ok(()))));
    assert_eq!(coord.fps_state("fps0"), Some(LoadState::Loaded));
    assert!(!host.paused(), "operator command failures never pause");
}

#[test]
fn exhausted_retries_fail_without_pausing_the_host() {
    let (mut coord, sim, host, clock) = rig_with(FeederCfg::default());
    sim.set_filament(1, true);
    tick(&mut coord, &sim, &clock);

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    // Never move the encoder: every attempt sticks, backoffs 1 s, 2 s, 3 s.
    let mut outcome = None;
    for _ in 0..60 {
        tick(&mut coord, &sim, &clock);
        if let Some(TicketState::Done(result)) = coord.ticket_state(ticket) {
            outcome = Some(result);
            break;
        }
    }
    match outcome {
        Some(Err(AmsError::LoadFailed {
            feeder,
            bay,
            attempts,
            reason,
        })) => {
            assert_eq!(feeder, "ams0");
            assert_eq!(bay, 1);
            assert_eq!(attempts, 3);
            assert_eq!(reason, FailReason::Stuck);
        }
        other => panic!("expected LoadFailed after 3 attempts, got {other:?}"),
    }
    assert_eq!(load_commands(&sim), 3);
    assert_eq!(coord.fps_state("fps0"), Some(LoadState::Unloaded));
    assert!(!host.paused(), "operator command failures never pause");
    // The failing lane is marked.
    assert!(sim.commands().contains(&SimCommand::Led { bay: 1, on: true }));
}

#[test]
fn backoff_delays_are_monotone_and_capped() {
    let cfg = FeederCfg::default();
    let mut last = 0;
    for attempt in 1..10 {
        let delay = oams_core::backoff_delay_ms(
            cfg.retry_backoff_base_ms,
            cfg.retry_backoff_max_ms,
            attempt,
        );
        assert!(delay >= last, "backoff must be monotone non-decreasing");
        assert!(delay <= cfg.retry_backoff_max_ms);
        last = delay;
    }
}

#[test]
fn stalled_mcu_times_out() {
    let cfg = FeederCfg {
        load_timeout_ms: 2_000,
        ..FeederCfg::default()
    };
    let (mut coord, sim, _host, clock) = rig_with(cfg);
    sim.set_filament(1, true);
    tick(&mut coord, &sim, &clock);

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    // Encoder keeps turning (no stall) but the MCU never reports done.
    let mut outcome = None;
    for _ in 0..12 {
        sim.add_encoder(40);
        tick(&mut coord, &sim, &clock);
        if let Some(TicketState::Done(result)) = coord.ticket_state(ticket) {
            outcome = Some(result);
            break;
        }
    }
    match outcome {
        Some(Err(AmsError::LoadFailed { reason, .. })) => {
            assert_eq!(reason, FailReason::Timeout);
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

#[test]
fn cancel_stops_the_feeder_and_resolves_cancelled() {
    let (mut coord, sim, _host, clock) = rig_with(FeederCfg::default());
    sim.set_filament(1, true);
    tick(&mut coord, &sim, &clock);

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    tick(&mut coord, &sim, &clock);
    coord.cancel(ticket).expect("cancel accepted");

    match coord.ticket_state(ticket) {
        Some(TicketState::Done(Err(AmsError::LoadFailed { reason, .. }))) => {
            assert_eq!(reason, FailReason::Cancelled);
        }
        other => panic!("expected cancelled outcome, got {other:?}"),
    }
    assert!(sim.commands().contains(&SimCommand::Stop));
    // A fresh command is accepted afterwards.
    tick(&mut coord, &sim, &clock);
    coord.load_spool("fps0", Some("T0")).expect("feeder is free again");
}

#[test]
fn mcu_error_event_is_absorbed_by_the_retry_loop() {
    let (mut coord, sim, _host, clock) = rig_with(FeederCfg::default());
    sim.set_filament(1, true);
    tick(&mut coord, &sim, &clock);

    let ticket = coord.load_spool("fps0", Some("T0")).expect("load");
    sim.push_error(2);
    tick(&mut coord, &sim, &clock);

    // The attempt failed, but the operation is still alive in cleanup.
    assert_eq!(coord.ticket_state(ticket), Some(TicketState::Pending));
    assert!(sim.commands().contains(&SimCommand::Stop));

    // Let the retry fire and succeed.
    for _ in 0..6 {
        tick(&mut coord, &sim, &clock);
    }
    assert_eq!(load_commands(&sim), 2);
    sim.set_pressure(0.8);
    sim.complete_load(1);
    tick(&mut coord, &sim, &clock);
    assert_eq!(coord.ticket_state(ticket), Some(TicketState::Done(Ok(()))));
}
