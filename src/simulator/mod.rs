//! In-process Logic 2 backend for tests and demos.
//!
//! [`SimulatedLogic2`] implements the automation `Manager` service over generated
//! signals (see [`signal`]), with the device catalog, analyzer settings tables, export
//! formats and capture files of the real application. It is served with the same
//! tonic stack the client connects with, so everything in this crate can be exercised
//! without hardware or a Logic 2 installation.
//!
//! ```no_run
//! # async fn demo() -> logic2_automation::Result<()> {
//! use logic2_automation::simulator::{self, SimulatorOptions};
//! use logic2_automation::{ConnectOptions, Manager};
//!
//! let sim = simulator::spawn(SimulatorOptions::default(), 0).await?;
//! let manager = Manager::connect(ConnectOptions::local(sim.port())).await?;
//! # manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod analyzers;
pub mod devices;
pub mod export;
pub mod service;
pub mod signal;
pub mod storage;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manager::API_VERSION;
use crate::models::{DeviceDesc, Version};
use crate::proto::manager_server::ManagerServer;

pub use service::SimulatedLogic2;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Identity and devices of a simulated backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorOptions {
    /// Process id reported by `GetAppInfo`
    pub app_pid: u64,
    /// Application version string
    pub app_version: String,
    /// Automation API version reported to clients
    pub api_version: Version,
    /// Attached devices
    pub devices: Vec<DeviceDesc>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            app_pid: u64::from(std::process::id()),
            app_version: format!("{}-sim", env!("CARGO_PKG_VERSION")),
            api_version: API_VERSION,
            devices: devices::simulation_devices(),
        }
    }
}

impl SimulatorOptions {
    /// Report a different API version.
    #[must_use]
    pub fn with_api_version(mut self, version: Version) -> Self {
        self.api_version = version;
        self
    }

    /// Report a different process id.
    #[must_use]
    pub fn with_app_pid(mut self, pid: u64) -> Self {
        self.app_pid = pid;
        self
    }
}

/// A backend running on a background task. Dropping the handle stops the server.
#[derive(Debug)]
pub struct SimulatorHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop the server and wait for open connections to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Simulator task ended abnormally"),
                Err(_) => warn!("Simulator still had open connections after {SHUTDOWN_GRACE:?}"),
            }
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Start a backend on `127.0.0.1:port` (0 picks a free port).
pub async fn spawn(options: SimulatorOptions, port: u16) -> Result<SimulatorHandle> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel::<()>();

    let service = SimulatedLogic2::new(options);
    let task = tokio::spawn(async move {
        let served = Server::builder()
            .add_service(ManagerServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = rx.await;
            })
            .await;
        match served {
            Ok(()) => debug!(%addr, "Simulator stopped"),
            Err(err) => warn!(%addr, error = %err, "Simulator server error"),
        }
    });

    info!(%addr, "Simulated Logic 2 listening");
    Ok(SimulatorHandle {
        addr,
        shutdown: Some(tx),
        task: Some(task),
    })
}

/// Serve a backend on `addr` until `shutdown` completes.
pub async fn serve<F>(options: SimulatorOptions, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    info!(%addr, devices = options.devices.len(), "Simulated Logic 2 listening");
    Server::builder()
        .add_service(ManagerServer::new(SimulatedLogic2::new(options)))
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}
