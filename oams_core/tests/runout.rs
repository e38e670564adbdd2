//! Runout handling: detect at the hub, coast the follower, reload the
//! next lane or pause the print.

use std::sync::Arc;

use oams_core::mocks::MockHost;
use oams_core::{
    Coordinator, FeederCfg, FpsCfg, LoadState, ManagerCfg, RunoutState, TicketState,
};
use oams_hardware::{SimCommand, SimulatedFeeder};
use oams_traits::{FollowerDirection, TickClock};

struct Rig {
    coord: Coordinator,
    sim: SimulatedFeeder,
    host: Arc<MockHost>,
    clock: TickClock,
}

fn rig(groups: Vec<(&str, Vec<(&str, u8)>)>) -> Rig {
    let sim = SimulatedFeeder::new();
    let host = Arc::new(MockHost::new());
    let clock = TickClock::new();
    let manager = ManagerCfg {
        reload_before_toolhead_distance: 10.0,
        runout_pause_distance: 5.0,
        ..ManagerCfg::default()
    };
    let mut builder = Coordinator::builder()
        .with_clock(Arc::new(clock.clone()))
        .with_host(host.clone())
        .with_manager(manager)
        .add_feeder("ams0", FeederCfg::default(), Box::new(sim.clone()))
        .add_fps(
            "fps0",
            FpsCfg {
                pin: "PA1".into(),
                extruder: "extruder".into(),
                feeders: vec!["ams0".into()],
            },
        );
    for (name, members) in groups {
        builder = builder.add_group(
            name,
            members.into_iter().map(|(f, b)| (f.to_string(), b)).collect(),
        );
    }
    Rig {
        coord: builder.build().expect("build coordinator"),
        sim,
        host,
        clock,
    }
}

impl Rig {
    fn tick(&mut self) {
        self.clock.tick();
        self.sim.push_telemetry();
        self.coord.tick();
    }

    /// Load bay 1 of T0 and switch the follower on, as during a print.
    fn load_and_follow(&mut self) {
        self.sim.set_filament(1, true);
        self.tick();
        let ticket = self.coord.load_spool("fps0", Some("T0")).expect("load");
        self.sim.set_pressure(0.8);
        self.sim.complete_load(1);
        self.tick();
        assert_eq!(
            self.coord.ticket_state(ticket),
            Some(TicketState::Done(Ok(())))
        );
        self.coord
            .set_follower("fps0", true, FollowerDirection::Forward)
            .expect("follower on");
        self.tick();
        assert_eq!(self.coord.runout_state("fps0"), Some(RunoutState::Monitoring));
    }

    /// Spool runs dry at the given extruder position.
    fn run_dry(&mut self, position: f64) {
        self.host.set_position(position);
        self.sim.set_filament(1, false);
        self.sim.set_hub(1, false);
        self.tick();
        assert_eq!(self.coord.runout_state("fps0"), Some(RunoutState::Detected));
    }

    fn follower_commands(&self) -> Vec<SimCommand> {
        self.sim
            .commands()
            .into_iter()
            .filter(|c| matches!(c, SimCommand::Follower { .. }))
            .collect()
    }
}

#[test]
fn runout_with_backup_reloads_and_resumes_following() {
    let mut rig = rig(vec![("T0", vec![("ams0", 1), ("ams0", 2)])]);
    rig.sim.set_filament(2, true);
    rig.load_and_follow();

    rig.run_dry(100.0);
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Detected));

    // Not yet at the pause distance.
    rig.host.set_position(104.0);
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Detected));

    // 5 mm past the trigger: follower coasts.
    rig.host.set_position(105.0);
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Coasting));
    assert!(rig.follower_commands().contains(&SimCommand::Follower {
        enable: false,
        direction: FollowerDirection::Forward
    }));

    // Past the coast distance but the bowden has not drained yet.
    rig.host.set_position(110.0);
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Coasting));

    // Pressure below the lower threshold, sustained for the grace window.
    rig.sim.set_pressure(0.1);
    rig.tick();
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Reloading));
    assert!(rig.sim.commands().contains(&SimCommand::Load(2)));

    // Firmware finishes the reload; follower resumes automatically.
    rig.sim.add_encoder(80);
    rig.tick();
    rig.sim.set_pressure(0.8);
    rig.sim.complete_load(2);
    rig.tick();

    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Monitoring));
    assert_eq!(rig.coord.fps_state("fps0"), Some(LoadState::Loaded));
    let binding = rig.coord.fps_binding("fps0").expect("rebound");
    assert_eq!(binding.bay, 2);
    assert_eq!(
        rig.follower_commands().last(),
        Some(&SimCommand::Follower {
            enable: true,
            direction: FollowerDirection::Forward
        })
    );
    assert!(!rig.host.paused());
}

#[test]
fn runout_without_backup_pauses_the_print() {
    let mut rig = rig(vec![("T0", vec![("ams0", 1), ("ams0", 2)])]);
    // Bay 2 stays empty: no backup anywhere.
    rig.load_and_follow();
    rig.run_dry(100.0);

    rig.host.set_position(105.0);
    rig.tick();
    rig.host.set_position(110.0);
    rig.sim.set_pressure(0.1);
    rig.tick();
    rig.tick();

    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Paused));
    assert!(rig.host.paused());
    let pauses = rig.host.pauses();
    assert!(
        pauses[0].contains("no runout backup") && pauses[0].contains("T0"),
        "unexpected pause reason: {}",
        pauses[0]
    );
}

#[test]
fn runout_override_wins_over_group_rotation() {
    let mut rig = rig(vec![
        ("T0", vec![("ams0", 1), ("ams0", 2)]),
        ("T1", vec![("ams0", 3)]),
    ]);
    rig.sim.set_filament(2, true);
    rig.sim.set_filament(3, true);
    rig.coord.set_runout("T0", "T1").expect("override accepted");
    rig.load_and_follow();
    rig.run_dry(100.0);

    rig.host.set_position(105.0);
    rig.tick();
    rig.host.set_position(110.0);
    rig.sim.set_pressure(0.1);
    rig.tick();
    rig.tick();

    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Reloading));
    // The override lane's bay wins even though bay 2 of T0 is ready.
    assert!(rig.sim.commands().contains(&SimCommand::Load(3)));
    assert!(!rig.sim.commands().contains(&SimCommand::Load(2)));
}

#[test]
fn spool_added_during_coast_is_picked_up() {
    let mut rig = rig(vec![("T0", vec![("ams0", 1), ("ams0", 2)])]);
    // Nothing ready when the runout triggers.
    rig.load_and_follow();
    rig.run_dry(100.0);
    rig.host.set_position(105.0);
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Coasting));

    // The user seats a spool while the tail coasts through the bowden.
    rig.sim.set_filament(2, true);
    rig.host.set_position(110.0);
    rig.sim.set_pressure(0.1);
    rig.tick();
    rig.tick();

    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Reloading));
    assert!(rig.sim.commands().contains(&SimCommand::Load(2)));
}

#[test]
fn deliberate_unload_never_counts_as_runout() {
    let mut rig = rig(vec![("T0", vec![("ams0", 1)])]);
    rig.load_and_follow();

    let ticket = rig.coord.unload_spool("fps0").expect("unload");
    rig.tick();
    rig.sim.complete_unload();
    rig.tick();
    assert_eq!(
        rig.coord.ticket_state(ticket),
        Some(TicketState::Done(Ok(())))
    );
    // The monitor stands down instead of firing a runout.
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Stopped));
    assert!(!rig.host.paused());
}

#[test]
fn failed_reload_pauses_the_print() {
    let mut rig = rig(vec![("T0", vec![("ams0", 1), ("ams0", 2)])]);
    rig.sim.set_filament(2, true);
    rig.load_and_follow();
    rig.run_dry(100.0);
    rig.host.set_position(105.0);
    rig.tick();
    rig.host.set_position(110.0);
    rig.sim.set_pressure(0.1);
    rig.tick();
    rig.tick();
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Reloading));

    // The reload sticks through all retries: encoder frozen throughout.
    for _ in 0..80 {
        rig.tick();
        if rig.coord.runout_state("fps0") == Some(RunoutState::Paused) {
            break;
        }
    }
    assert_eq!(rig.coord.runout_state("fps0"), Some(RunoutState::Paused));
    assert!(rig.host.paused());
}
