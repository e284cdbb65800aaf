//! Connecting, launching and device discovery against the simulated backend.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use logic2_automation::simulator::SimulatorOptions;
use logic2_automation::{
    AutomationError, ConnectOptions, DeviceType, ErrorKind, LaunchOptions, Manager, Version,
    API_VERSION,
};

use common::{connect, digital, setup, start_simulator, timed};

fn simulator_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_logic2-sim"))
}

#[tokio::test]
async fn test_app_info_matches_simulator() {
    let (_sim, manager) = setup().await;

    let info = manager.get_app_info().await.unwrap();
    assert_eq!(info.api_version, API_VERSION);
    assert_eq!(info.app_pid, u64::from(std::process::id()));
    assert_eq!(manager.app_info(), &info, "Cached info should match a fresh query");
    assert!(manager.endpoint().starts_with("http://127.0.0.1:"));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_simulation_devices_are_opt_in() {
    let (_sim, manager) = setup().await;

    let devices = manager.get_devices(true).await.unwrap();
    assert_eq!(devices.len(), 3, "Three simulation devices expected");
    assert!(devices.iter().all(|d| d.is_simulation));
    let types: Vec<DeviceType> = devices.iter().map(|d| d.device_type).collect();
    assert!(types.contains(&DeviceType::Logic8));
    assert!(types.contains(&DeviceType::LogicPro8));
    assert!(types.contains(&DeviceType::LogicPro16));

    let physical = manager.get_devices(false).await.unwrap();
    assert!(physical.is_empty(), "No physical devices are attached");

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_major_version_mismatch_is_rejected() {
    let sim = start_simulator(SimulatorOptions::default().with_api_version(Version::new(2, 0, 0))).await;

    let err = Manager::connect(ConnectOptions::local(sim.port()))
        .await
        .unwrap_err();
    match err {
        AutomationError::IncompatibleApiVersion { client, server } => {
            assert_eq!(client, API_VERSION);
            assert_eq!(server.major, 2);
        }
        other => panic!("expected IncompatibleApiVersion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_newer_minor_server_is_accepted() {
    let sim = start_simulator(SimulatorOptions::default().with_api_version(Version::new(1, 7, 0))).await;
    let manager = connect(&sim).await;
    assert_eq!(manager.app_info().api_version, Version::new(1, 7, 0));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_address_is_refused() {
    let options = ConnectOptions {
        address: "192.168.1.20".to_string(),
        ..ConnectOptions::local(10430)
    };
    let err = Manager::connect(options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_closed_manager_rejects_everything() {
    let (_sim, manager) = setup().await;
    let mut capture = manager
        .start_capture(None, &digital([0], 1_000_000), &timed(0.05))
        .await
        .unwrap();
    capture.wait().await.unwrap();

    manager.close().await.unwrap();
    manager.close().await.unwrap();
    assert!(manager.is_closed().await);

    assert!(matches!(
        manager.get_devices(true).await,
        Err(AutomationError::ManagerClosed)
    ));
    assert!(matches!(
        manager.start_capture(None, &digital([0], 1_000_000), &timed(0.1)).await,
        Err(AutomationError::ManagerClosed)
    ));
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        capture.export_raw_data_csv(dir.path(), &Default::default()).await,
        Err(AutomationError::ManagerClosed)
    ));

    // Nothing left to release on the backend; closing just marks the capture closed.
    capture.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_server_times_out() {
    // Accepts TCP connections and holds them open without ever speaking HTTP/2.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let timeout = Duration::from_millis(300);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Manager::connect(ConnectOptions::local(port).with_timeout(timeout)),
    )
    .await
    .expect("connect must give up once its own timeout elapses");

    match result {
        Err(AutomationError::ConnectionTimeout { timeout: reported, .. }) => {
            assert_eq!(reported, timeout)
        }
        other => panic!("expected ConnectionTimeout, got {other:?}"),
    }
    silent.abort();
}

#[tokio::test]
async fn test_unbounded_timeout_connects() {
    let sim = start_simulator(SimulatorOptions::default()).await;
    let manager = Manager::connect(ConnectOptions::local(sim.port()).with_timeout(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(manager.app_info().api_version, API_VERSION);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_launch_missing_executable() {
    let options = LaunchOptions::with_application("/definitely/not/logic2");
    let err = Manager::launch(options).await.unwrap_err();
    assert!(matches!(err, AutomationError::Launch(_)), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_launch_and_close_terminates_process() {
    let port = common::free_port();
    let options = LaunchOptions {
        port,
        connect_timeout: Duration::from_secs(20),
        extra_args: vec!["--disable-gpu".to_string()],
        ..LaunchOptions::with_application(simulator_binary())
    };

    let manager = Manager::launch(options).await.unwrap();
    let pid = manager.process_id().await.expect("launched process should have a pid");
    assert_eq!(manager.app_info().app_pid, u64::from(pid));

    let devices = manager.get_devices(true).await.unwrap();
    assert_eq!(devices.len(), 3);

    manager.close().await.unwrap();
    assert!(manager.process_id().await.is_none());

    let err = Manager::connect(ConnectOptions::local(port).with_timeout(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::ConnectionTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_launch_detects_running_instance() {
    // An instance is already serving the port; the launched process cannot bind and the
    // client talks to the existing one, which reports a different pid.
    let sim = start_simulator(SimulatorOptions::default().with_app_pid(1)).await;
    let options = LaunchOptions {
        port: sim.port(),
        connect_timeout: Duration::from_secs(10),
        ..LaunchOptions::with_application(simulator_binary())
    };

    let err = Manager::launch(options).await.unwrap_err();
    match err {
        AutomationError::Logic2AlreadyRunning { connected, .. } => assert_eq!(connected, 1),
        other => panic!("expected Logic2AlreadyRunning, got {other:?}"),
    }
}
