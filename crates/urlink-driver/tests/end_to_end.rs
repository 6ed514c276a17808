mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Driver, SimController, eventually, fast_timing};
use urlink_driver::Timing;
use urlink_types::{ConnectionState, EventPayload, RobotMode, UrError};
use urlink_middleware::Topic;

#[tokio::test]
async fn supervisor_programs_robot_and_binds_channel() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;

    eventually(Duration::from_secs(3), "a bound channel", || {
        driver.endpoints.channel().is_some()
    })
    .await;
    assert_eq!(sim.count(|c| &c.programs), 1);
    assert!(sim.count(|c| &c.resets) >= 1);
    assert_eq!(driver.connection.state(), ConnectionState::Executing);

    let channel = driver.endpoints.channel().unwrap();
    eventually(Duration::from_secs(1), "reverse joint states", || {
        channel.last_joint_state().is_some()
    })
    .await;
    let record = channel.last_joint_state().unwrap();
    assert_eq!(record.position, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    assert_eq!(record.names[0], "shoulder_pan_joint");
}

#[tokio::test]
async fn closed_reverse_socket_triggers_reprogramming() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;
    let first = driver.registry.current().unwrap();

    sim.kill_sessions();
    let killed = Instant::now();
    eventually(Duration::from_secs(2), "registry to empty", || {
        driver
            .registry
            .current()
            .is_none_or(|current| !Arc::ptr_eq(&current, &first))
    })
    .await;
    assert!(killed.elapsed() <= Duration::from_millis(1200));

    eventually(Duration::from_secs(3), "a second channel", || {
        driver
            .registry
            .current()
            .is_some_and(|current| !Arc::ptr_eq(&current, &first))
    })
    .await;
    assert_eq!(sim.count(|c| &c.programs), 2);
    eventually(Duration::from_secs(1), "endpoints rebound", || {
        driver
            .endpoints
            .channel()
            .is_some_and(|bound| !Arc::ptr_eq(&bound, &first))
    })
    .await;
}

#[tokio::test]
async fn silent_program_is_detected_within_liveness_window() {
    let sim = SimController::start().await;
    // Real reverse-channel timing; only the supervisor's waits are shortened.
    let timing = Timing {
        reverse_poll: Timing::default().reverse_poll,
        liveness: Timing::default().liveness,
        ..fast_timing()
    };
    let driver = Driver::start(&sim, timing).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;
    let first = driver.registry.current().unwrap();
    eventually(Duration::from_secs(1), "first heartbeat", || {
        first.last_joint_state().is_some()
    })
    .await;

    sim.set_silent(true);
    let silenced = Instant::now();
    eventually(Duration::from_secs(3), "liveness timeout", || {
        driver
            .registry
            .current()
            .is_none_or(|current| !Arc::ptr_eq(&current, &first))
    })
    .await;
    let detected = silenced.elapsed();
    assert!(detected >= Duration::from_millis(900), "detected too early: {detected:?}");
    assert!(detected <= Duration::from_millis(1400), "detected too late: {detected:?}");

    sim.set_silent(false);
    eventually(Duration::from_secs(3), "replacement channel", || {
        driver
            .registry
            .current()
            .is_some_and(|current| !Arc::ptr_eq(&current, &first))
    })
    .await;
}

#[tokio::test]
async fn free_drive_toggle_swaps_programs() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.endpoints.channel().is_some()
    })
    .await;
    let resets_before = sim.count(|c| &c.resets);

    assert_eq!(driver.endpoints.set_free_drive(true), "set freedrive true");
    eventually(Duration::from_secs(2), "free-drive program", || {
        sim.count(|c| &c.free_drives) == 1
    })
    .await;
    eventually(Duration::from_secs(1), "FREE_DRIVE state", || {
        driver.connection.state() == ConnectionState::FreeDrive
    })
    .await;

    assert_eq!(driver.endpoints.set_free_drive(false), "set freedrive false");
    eventually(Duration::from_secs(3), "servo program again", || {
        sim.count(|c| &c.programs) == 2 && driver.registry.current().is_some()
    })
    .await;
    assert!(sim.count(|c| &c.resets) > resets_before);
    assert_eq!(sim.count(|c| &c.free_drives), 1);
}

#[tokio::test]
async fn prevent_programming_edge_sends_reset() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;
    let resets_before = sim.count(|c| &c.resets);

    driver.flags.set_prevent_programming(true);
    eventually(Duration::from_secs(1), "reset program", || {
        sim.count(|c| &c.resets) == resets_before + 1
    })
    .await;
    // Level, not edge: no further resets while the flag stays set.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.count(|c| &c.resets), resets_before + 1);
}

#[tokio::test]
async fn shutdown_sends_one_quit() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;

    driver.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(2), driver.supervisor)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert_eq!(result, Ok(()));
    eventually(Duration::from_secs(1), "quit at the robot", || {
        sim.count(|c| &c.quits) == 1
    })
    .await;
}

#[tokio::test]
async fn disabled_robot_stops_the_supervisor() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    let mut alerts = driver.bus.subscribe_to(Topic::DriverAlerts);
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;

    sim.set_robot(RobotMode::Ready, false);
    let result = tokio::time::timeout(Duration::from_secs(2), driver.supervisor)
        .await
        .expect("supervisor ignored the disabled robot")
        .unwrap();
    assert_eq!(result, Err(UrError::RobotDisabled));

    let mut saw_disconnect = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), alerts.recv()).await {
        if let EventPayload::ConnectionChanged {
            to: ConnectionState::Disconnected,
            ..
        } = event.payload
        {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn halted_robot_is_reprogrammed_once_ready_again() {
    let sim = SimController::start().await;
    let driver = Driver::start(&sim, fast_timing()).await;
    eventually(Duration::from_secs(3), "first channel", || {
        driver.registry.current().is_some()
    })
    .await;

    sim.set_robot(RobotMode::SecurityStopped, true);
    eventually(Duration::from_secs(1), "halt", || {
        driver.connection.state() == ConnectionState::Connected
    })
    .await;
    sim.kill_sessions();
    eventually(Duration::from_secs(2), "empty registry", || {
        driver.registry.current().is_none()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.count(|c| &c.programs), 1, "must not program a halted robot");

    sim.set_robot(RobotMode::Ready, true);
    eventually(Duration::from_secs(3), "reprogrammed", || {
        sim.count(|c| &c.programs) == 2 && driver.registry.current().is_some()
    })
    .await;
}
