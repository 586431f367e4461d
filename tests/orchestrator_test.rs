//! End-to-end runs against the simulated rig and camera.

mod common;

use common::{simulated_rig, wait_for, JPEG_ONLY, PORT};
use rig_control::adapters::Transport;
use rig_control::machine::MachineStatus;
use rig_control::model::{Action, Pose, Position};
use rig_control::notify::Signal;
use rig_control::runner::{RunKind, RunState};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn scan() -> Vec<Pose> {
    vec![
        Pose::at(1, Position::new(10.0, 0.0, 0.0, 0.0, 0.0))
            .with_payload(Action::shutter(3, Some(1.5))),
        Pose::at(2, Position::new(0.0, 0.0, 0.0, 45.0, 0.0))
            .with_payload(Action::remote_snap(5, true)),
        Pose::at(1, Position::new(20.0, 0.0, 5.0, 0.0, -10.0)),
    ]
}

#[test]
fn test_connect_unlocks_and_reports_ready() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();

    assert!(sim.rig.wait_until_ready(TIMEOUT));
    assert_eq!(sim.rig.status(), MachineStatus::Idle);
    assert_eq!(sim.log.count_containing(Signal::Info, "machine ready"), 1);
    assert!(sim.rig.cameras().is_some_and(|b| b.is_pumping()));

    let written = sim.factory.transport(PORT).unwrap().written();
    assert!(written.contains(&">1$X".to_string()));
    assert!(written.contains(&">2G90".to_string()));

    sim.rig.disconnect().unwrap();
    assert!(!sim.factory.transport(PORT).unwrap().is_connected());
    assert!(!sim.sdk.is_initialized());
}

#[test]
fn test_homing_then_imaging_completes() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();
    assert!(sim.rig.wait_until_ready(TIMEOUT));

    sim.rig.start_homing().unwrap();
    assert_eq!(sim.rig.wait_for_run(RunKind::Homing, TIMEOUT), RunState::Complete);
    assert!(sim.rig.devices().iter().filter(|d| d.device_id <= 2).all(|d| d.is_homed));

    sim.rig.start_imaging(&scan()).unwrap();
    assert_eq!(sim.rig.wait_for_run(RunKind::Imaging, TIMEOUT), RunState::Complete);
    assert!(sim.rig.runs().is_sending());

    let written = sim.factory.transport(PORT).unwrap().written();
    let run_lines: Vec<&String> = written
        .iter()
        .filter(|l| l.contains("G1X") || l.contains("C0"))
        .collect();
    assert_eq!(
        run_lines,
        vec![
            ">1G1X10.000Y0.000Z0.000P0.000T0.000",
            ">3C0S1.500",
            ">2G1X0.000Y0.000Z0.000P45.000T0.000",
            ">1G1X20.000Y0.000Z5.000P0.000T-10.000",
        ]
    );

    assert_eq!(sim.sdk.download_count(), 1);
    let device = sim.rig.devices().into_iter().find(|d| d.device_id == 1).unwrap();
    assert!(device.position.approx_eq(&Position::new(20.0, 0.0, 5.0, 0.0, -10.0)));
    assert!(wait_for(TIMEOUT, || {
        sim.log.count_containing(Signal::Info, "Capture on device 5 complete") == 1
    }));

    sim.rig.disconnect().unwrap();
}

#[test]
fn test_cancel_imaging_empties_queue() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();
    assert!(sim.rig.wait_until_ready(TIMEOUT));

    // Hold the handshake so the run stalls mid-sequence
    sim.rig.context().cts.set(false);
    sim.rig.start_imaging(&scan()).unwrap();
    assert!(sim.rig.is_imaging());

    assert!(sim.rig.cancel_imaging());
    assert!(!sim.rig.is_imaging());
    assert!(sim.rig.context().queue.is_empty());
    assert!(sim.rig.context().cts.is_clear());
    assert_eq!(sim.rig.run_state(), RunState::Cancelled);

    sim.rig.disconnect().unwrap();
}

#[test]
fn test_pause_and_resume_continue_from_queue() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();
    assert!(sim.rig.wait_until_ready(TIMEOUT));

    sim.rig.context().cts.set(false);
    sim.rig.start_imaging(&scan()).unwrap();
    assert!(sim.rig.pause());
    assert_eq!(sim.rig.run_state(), RunState::Paused);
    let queued = sim.rig.context().queue.len();
    assert!(queued > 0);

    sim.rig.context().cts.set(true);
    assert!(sim.rig.resume().unwrap());
    assert_eq!(sim.rig.wait_for_run(RunKind::Imaging, TIMEOUT), RunState::Complete);
    assert!(sim.rig.context().queue.is_empty());

    sim.rig.disconnect().unwrap();
}

#[test]
fn test_alarm_while_busy_cancels_imaging() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();
    assert!(sim.rig.wait_until_ready(TIMEOUT));

    // Stall the run behind the first move
    sim.rig.context().cts.set(false);
    sim.rig.start_imaging(&scan()).unwrap();
    let far = Action::move_to(1, Position::new(99.0, 0.0, 0.0, 0.0, 0.0), false);
    sim.rig
        .context()
        .update(|m| m.on_dispatch(&[far], Instant::now()));

    let transport = sim.factory.transport(PORT).unwrap();
    transport.push_line(">1ALARM:1");

    assert!(wait_for(TIMEOUT, || !sim.rig.is_imaging()));
    assert!(sim.rig.context().queue.is_empty());
    assert_eq!(sim.rig.run_state(), RunState::Cancelled);

    sim.rig.disconnect().unwrap();
}

#[test]
fn test_lost_link_faults_run() {
    let dir = tempfile::tempdir().unwrap();
    let sim = simulated_rig(&common::rig_config(dir.path()), JPEG_ONLY);
    sim.rig.connect_all().unwrap();
    assert!(sim.rig.wait_until_ready(TIMEOUT));

    sim.rig.context().cts.set(false);
    sim.rig.start_imaging(&scan()).unwrap();
    sim.factory.transport(PORT).unwrap().set_connected(false);

    assert_eq!(sim.rig.wait_for_run(RunKind::Imaging, TIMEOUT), RunState::Faulted);
    assert!(sim.log.count_containing(Signal::Error, "Lost connection") >= 1);
    sim.rig.disconnect().unwrap();
}
