//! Shared fixtures: an in-process simulated backend and a manager connected to it.
#![allow(dead_code)]

use std::time::Duration;

use logic2_automation::simulator::{self, SimulatorHandle, SimulatorOptions};
use logic2_automation::{
    CaptureConfiguration, ConnectOptions, DeviceConfiguration, LogicDeviceConfiguration, Manager,
};

/// Id of the simulated Logic 8.
pub const LOGIC_8: &str = "F4243";
/// Id of the simulated Logic Pro 8.
pub const LOGIC_PRO_8: &str = "F4244";
/// Id of the simulated Logic Pro 16.
pub const LOGIC_PRO_16: &str = "F4241";

pub async fn start_simulator(options: SimulatorOptions) -> SimulatorHandle {
    simulator::spawn(options, 0)
        .await
        .expect("simulator should bind an ephemeral port")
}

pub async fn connect(sim: &SimulatorHandle) -> Manager {
    Manager::connect(ConnectOptions::local(sim.port()).with_timeout(Duration::from_secs(5)))
        .await
        .expect("manager should connect to the simulator")
}

/// Simulator with default options plus a connected manager.
pub async fn setup() -> (SimulatorHandle, Manager) {
    let sim = start_simulator(SimulatorOptions::default()).await;
    let manager = connect(&sim).await;
    (sim, manager)
}

pub fn digital(channels: impl IntoIterator<Item = u32>, rate: u32) -> DeviceConfiguration {
    LogicDeviceConfiguration::digital(channels, rate).into()
}

pub fn timed(seconds: f64) -> CaptureConfiguration {
    CaptureConfiguration::timed(seconds)
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}
