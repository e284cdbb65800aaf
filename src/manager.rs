//! Connection to a Logic 2 instance.
//!
//! A [`Manager`] owns one gRPC channel to the Logic 2 automation server and, when it
//! was created with [`Manager::launch`], the Logic 2 process itself. Captures started or
//! loaded through a manager share its channel; closing the manager invalidates them.
//!
//! Connection establishment is the only operation with a client-side timeout. The TCP
//! connect and the first `GetAppInfo` call are retried every 100 ms until the server
//! answers or the timeout expires.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, instrument, warn};

use crate::capture::{Capture, CaptureState};
use crate::config::AutomationConfig;
use crate::convert::ToDomain;
use crate::error::{AutomationError, Result};
use crate::models::{AppInfo, CaptureConfiguration, DeviceConfiguration, DeviceDesc, Version};
use crate::proto::{self, manager_client::ManagerClient};

/// Default automation port of Logic 2.
pub const DEFAULT_PORT: u16 = 10430;

/// Automation API version implemented by this client.
pub const API_VERSION: Version = Version::new(1, 0, 0);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for [`Manager::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Host running Logic 2; only loopback addresses are accepted
    pub address: String,
    /// Automation port
    pub port: u16,
    /// How long to wait for the server to answer
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    /// Loopback connection on `port` with the default timeout.
    #[must_use]
    pub fn local(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Options for [`Manager::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Logic 2 executable; the platform install location when `None`
    pub application_path: Option<PathBuf>,
    /// Automation port passed to the application
    pub port: u16,
    /// How long to wait for the launched application to answer
    pub connect_timeout: Duration,
    /// Additional command line arguments
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            application_path: None,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    /// Launch the executable at `path` with default options.
    #[must_use]
    pub fn with_application(path: impl Into<PathBuf>) -> Self {
        Self {
            application_path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Channel shared between a manager and its captures.
///
/// The client is taken out on [`Manager::close`]; every later call fails with
/// [`AutomationError::ManagerClosed`].
pub(crate) struct Session {
    client: RwLock<Option<ManagerClient<Channel>>>,
}

impl Session {
    fn new(client: ManagerClient<Channel>) -> Arc<Self> {
        Arc::new(Self {
            client: RwLock::new(Some(client)),
        })
    }

    /// Clone of the generated client for one call.
    pub(crate) async fn client(&self) -> Result<ManagerClient<Channel>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(AutomationError::ManagerClosed)
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.client.read().await.is_none()
    }

    async fn shutdown(&self) -> bool {
        self.client.write().await.take().is_some()
    }
}

/// Decode a failed RPC and log it.
pub(crate) fn rpc_error(rpc: &'static str, status: tonic::Status) -> AutomationError {
    let err = AutomationError::from_status(status);
    warn!(
        rpc,
        code = ?err.code().map(|c| c as i32),
        kind = %err.kind(),
        error = %err,
        "Logic 2 request failed"
    );
    err
}

/// Connection to one Logic 2 instance.
pub struct Manager {
    session: Arc<Session>,
    app_info: AppInfo,
    endpoint: String,
    process: Mutex<Option<Child>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("endpoint", &self.endpoint)
            .field("app_info", &self.app_info)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Attach to a running Logic 2 instance.
    ///
    /// Fails with [`AutomationError::ConnectionTimeout`] when the server does not answer
    /// within `options.connect_timeout`, and with
    /// [`AutomationError::IncompatibleApiVersion`] on a major version mismatch.
    #[instrument(skip(options), fields(address = %options.address, port = options.port))]
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let endpoint = endpoint_url(&options.address, options.port)?;
        let (client, app_info) = establish(&endpoint, options.connect_timeout, None).await?;
        check_api_version(&app_info.api_version)?;

        info!(
            app_version = %app_info.app_version,
            api_version = %app_info.api_version,
            "Connected to Logic 2"
        );

        Ok(Self {
            session: Session::new(client),
            app_info,
            endpoint,
            process: Mutex::new(None),
        })
    }

    /// Start Logic 2 with automation enabled and connect to it.
    ///
    /// The application is started as
    /// `<app> --automation --automationPort <port> <extra_args...>`. If another instance
    /// already serves the port, the pid reported by the server differs from the spawned
    /// one and [`AutomationError::Logic2AlreadyRunning`] is returned. The spawned process
    /// is killed on every failure path.
    #[instrument(skip(options), fields(port = options.port))]
    pub async fn launch(options: LaunchOptions) -> Result<Self> {
        let application = resolve_application_path(options.application_path.as_deref())?;
        let endpoint = endpoint_url("127.0.0.1", options.port)?;

        let mut child = Command::new(&application)
            .arg("--automation")
            .arg("--automationPort")
            .arg(options.port.to_string())
            .args(&options.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AutomationError::Launch(format!("failed to start {}: {e}", application.display()))
            })?;
        let pid = child.id().unwrap_or_default();
        info!(pid, application = %application.display(), "Launched Logic 2");

        let established = establish(&endpoint, options.connect_timeout, Some(&mut child))
            .await
            .and_then(|(client, app_info)| {
                if app_info.app_pid != u64::from(pid) {
                    return Err(AutomationError::Logic2AlreadyRunning {
                        launched: pid,
                        connected: app_info.app_pid,
                    });
                }
                check_api_version(&app_info.api_version)?;
                Ok((client, app_info))
            });

        match established {
            Ok((client, app_info)) => Ok(Self {
                session: Session::new(client),
                app_info,
                endpoint,
                process: Mutex::new(Some(child)),
            }),
            Err(err) => {
                terminate(&mut child).await;
                Err(err)
            }
        }
    }

    /// Connect or launch according to configuration.
    pub async fn from_config(config: &AutomationConfig) -> Result<Self> {
        config.validate()?;
        if config.launch.enabled {
            Self::launch(config.launch_options()).await
        } else {
            Self::connect(config.connect_options()).await
        }
    }

    /// Application info captured while connecting.
    #[must_use]
    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    /// `http://host:port` of the automation server.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pid of the Logic 2 process spawned by this manager, if any.
    pub async fn process_id(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(Child::id)
    }

    /// Query application info from the server.
    #[instrument(skip(self))]
    pub async fn get_app_info(&self) -> Result<AppInfo> {
        let mut client = self.session.client().await?;
        let reply = client
            .get_app_info(proto::GetAppInfoRequest {})
            .await
            .map_err(|s| rpc_error("GetAppInfo", s))?
            .into_inner();
        Ok(reply.app_info.unwrap_or_default().to_domain())
    }

    /// Devices currently attached, in discovery order.
    ///
    /// Simulation devices are only returned when `include_simulation_devices` is set.
    #[instrument(skip(self))]
    pub async fn get_devices(&self, include_simulation_devices: bool) -> Result<Vec<DeviceDesc>> {
        let mut client = self.session.client().await?;
        let reply = client
            .get_devices(proto::GetDevicesRequest {
                include_simulation_devices,
            })
            .await
            .map_err(|s| rpc_error("GetDevices", s))?
            .into_inner();

        let devices = devices_from_reply(reply, include_simulation_devices);
        debug!(device_count = devices.len(), "Received device list");
        Ok(devices)
    }

    /// Start a capture.
    ///
    /// `device_id` of `None` lets Logic 2 pick its first device. Both configurations are
    /// validated by the server against the device's capabilities; an unsupported sample
    /// rate, threshold or channel fails with a device error.
    #[instrument(skip(self, device_configuration, capture_configuration))]
    pub async fn start_capture(
        &self,
        device_id: Option<&str>,
        device_configuration: &DeviceConfiguration,
        capture_configuration: &CaptureConfiguration,
    ) -> Result<Capture> {
        let mut client = self.session.client().await?;
        let reply = client
            .start_capture(proto::StartCaptureRequest {
                device_id: device_id.unwrap_or_default().to_string(),
                device_configuration: Some(device_configuration.into()),
                capture_configuration: Some(capture_configuration.into()),
            })
            .await
            .map_err(|s| rpc_error("StartCapture", s))?
            .into_inner();

        let info = reply.capture_info.unwrap_or_default();
        info!(capture_id = info.capture_id, "Capture started");
        Ok(Capture::new(
            Arc::clone(&self.session),
            info,
            CaptureState::Running,
        ))
    }

    /// Open a capture saved with [`Capture::save_capture`].
    #[instrument(skip(self, filepath), fields(filepath = %filepath.as_ref().display()))]
    pub async fn load_capture(&self, filepath: impl AsRef<Path>) -> Result<Capture> {
        let filepath = absolute_path(filepath.as_ref())?;
        let mut client = self.session.client().await?;
        let reply = client
            .load_capture(proto::LoadCaptureRequest { filepath })
            .await
            .map_err(|s| rpc_error("LoadCapture", s))?
            .into_inner();

        let info = reply.capture_info.unwrap_or_default();
        info!(capture_id = info.capture_id, "Capture loaded");
        Ok(Capture::new(
            Arc::clone(&self.session),
            info,
            CaptureState::Loaded,
        ))
    }

    /// Close the channel and terminate the Logic 2 process if this manager launched it.
    ///
    /// Idempotent. Captures obtained from this manager fail with
    /// [`AutomationError::ManagerClosed`] afterwards.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.session.shutdown().await {
            debug!(endpoint = %self.endpoint, "Closed automation channel");
        }
        if let Some(mut child) = self.process.lock().await.take() {
            terminate(&mut child).await;
        }
        Ok(())
    }

    /// Whether [`Manager::close`] has been called.
    pub async fn is_closed(&self) -> bool {
        self.session.is_closed().await
    }
}

/// Convert a device list, dropping simulation devices unless they were asked for.
fn devices_from_reply(reply: proto::GetDevicesReply, include_simulation: bool) -> Vec<DeviceDesc> {
    reply
        .devices
        .into_iter()
        .map(|device| -> DeviceDesc { device.to_domain() })
        .filter(|device| include_simulation || !device.is_simulation)
        .collect()
}

/// Build `http://host:port`, rejecting remote hosts.
pub(crate) fn endpoint_url(address: &str, port: u16) -> Result<String> {
    let ip: IpAddr = match address {
        "localhost" => IpAddr::from([127, 0, 0, 1]),
        other => other.parse().map_err(|_| {
            AutomationError::InvalidConfiguration(format!("'{other}' is not an IP address"))
        })?,
    };
    if !ip.is_loopback() {
        return Err(AutomationError::InvalidConfiguration(format!(
            "only local connections are supported, got {ip}"
        )));
    }
    Ok(match ip {
        IpAddr::V4(v4) => format!("http://{v4}:{port}"),
        IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
    })
}

fn default_application_path() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("ProgramW6432").map(|dir| PathBuf::from(dir).join("Logic").join("Logic.exe"))
    } else {
        None
    }
}

fn resolve_application_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => default_application_path().ok_or_else(|| {
            AutomationError::Launch(
                "no default Logic 2 location on this platform; set application_path".to_string(),
            )
        })?,
    };
    if !path.is_file() {
        return Err(AutomationError::Launch(format!(
            "Logic 2 executable not found at {}",
            path.display()
        )));
    }
    Ok(path)
}

pub(crate) fn absolute_path(path: &Path) -> Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(absolute.to_string_lossy().into_owned())
}

fn check_api_version(server: &Version) -> Result<()> {
    if server.major != API_VERSION.major {
        return Err(AutomationError::IncompatibleApiVersion {
            client: API_VERSION,
            server: *server,
        });
    }
    if !API_VERSION.is_compatible_with(server) {
        warn!(
            client = %API_VERSION,
            server = %server,
            "Client API version is newer than the server; newer features may be unavailable"
        );
    }
    Ok(())
}

/// Open the channel and fetch app info, retrying until `timeout` elapses.
///
/// The timeout bounds the whole exchange, so a server that accepts connections but
/// never answers also ends in [`AutomationError::ConnectionTimeout`]. When `child` is
/// given, an exit of that process aborts the retry loop.
async fn establish(
    endpoint: &str,
    timeout: Duration,
    child: Option<&mut Child>,
) -> Result<(ManagerClient<Channel>, AppInfo)> {
    let timed_out = || AutomationError::ConnectionTimeout {
        address: endpoint.to_string(),
        timeout,
    };
    // `None` when the timeout is too large to represent; wait without a deadline then.
    let deadline = Instant::now().checked_add(timeout);
    let attempt = open_session(endpoint, timeout, deadline, child);
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, attempt)
            .await
            .unwrap_or_else(|_| Err(timed_out())),
        None => attempt.await,
    }
}

async fn open_session(
    endpoint: &str,
    timeout: Duration,
    deadline: Option<Instant>,
    mut child: Option<&mut Child>,
) -> Result<(ManagerClient<Channel>, AppInfo)> {
    let timed_out = || AutomationError::ConnectionTimeout {
        address: endpoint.to_string(),
        timeout,
    };
    let no_time_left =
        || deadline.is_some_and(|deadline| Instant::now() + RETRY_INTERVAL > deadline);

    let target = Endpoint::from_shared(endpoint.to_string())?.connect_timeout(timeout);
    let channel = loop {
        match target.connect().await {
            Ok(channel) => break channel,
            Err(e) => {
                debug!(error = %e, "Automation server not reachable yet");
                if let Some(child) = child.as_deref_mut() {
                    if let Some(status) = child.try_wait()? {
                        return Err(AutomationError::Launch(format!(
                            "Logic 2 exited during startup ({status})"
                        )));
                    }
                }
                if no_time_left() {
                    return Err(timed_out());
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    };

    let mut client = ManagerClient::new(channel);
    loop {
        match client.get_app_info(proto::GetAppInfoRequest {}).await {
            Ok(reply) => {
                let app_info = reply.into_inner().app_info.unwrap_or_default().to_domain();
                return Ok((client, app_info));
            }
            Err(status) if status.code() == tonic::Code::Unavailable => {
                if no_time_left() {
                    return Err(timed_out());
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(status) => return Err(rpc_error("GetAppInfo", status)),
        }
    }
}

/// Kill a spawned process and wait briefly for it to exit.
async fn terminate(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        debug!(?pid, error = %e, "Logic 2 process already gone");
        return;
    }
    match tokio::time::timeout(PROCESS_EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(?pid, %status, "Logic 2 process exited"),
        Ok(Err(e)) => warn!(?pid, error = %e, "Failed to wait for Logic 2 process"),
        Err(_) => warn!(?pid, "Logic 2 process did not exit within {PROCESS_EXIT_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn rpc_errors_are_decoded_and_logged() {
        let status = crate::error::abort_status(proto::ErrorCode::ExportFailed, "disk full");
        let err = rpc_error("ExportRawDataCsv", status);
        assert!(matches!(err, AutomationError::Export(ref detail) if detail == "disk full"));
        assert!(logs_contain("Logic 2 request failed"));
        assert!(logs_contain("ExportRawDataCsv"));
    }

    #[test]
    fn simulation_devices_are_filtered_client_side() {
        let reply = proto::GetDevicesReply {
            devices: vec![
                proto::Device {
                    device_id: "F4241".to_string(),
                    device_type: proto::DeviceType::LogicPro16 as i32,
                    is_simulation: true,
                },
                proto::Device {
                    device_id: "A1B2C3".to_string(),
                    device_type: proto::DeviceType::Logic8 as i32,
                    is_simulation: false,
                },
            ],
        };

        let physical = devices_from_reply(reply.clone(), false);
        assert_eq!(physical.len(), 1, "Simulation device must be dropped");
        assert_eq!(physical[0].device_id, "A1B2C3");
        assert!(!physical[0].is_simulation);

        let all = devices_from_reply(reply, true);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].device_id, "F4241", "Discovery order is preserved");
    }

    #[test]
    fn endpoint_accepts_loopback_only() {
        assert_eq!(
            endpoint_url("127.0.0.1", 10430).unwrap(),
            "http://127.0.0.1:10430"
        );
        assert_eq!(endpoint_url("::1", 10430).unwrap(), "http://[::1]:10430");
        assert_eq!(
            endpoint_url("localhost", 1234).unwrap(),
            "http://127.0.0.1:1234"
        );
        assert!(matches!(
            endpoint_url("10.0.0.8", 10430),
            Err(AutomationError::InvalidConfiguration(_))
        ));
        assert!(endpoint_url("logic-host", 10430).is_err());
    }

    #[test]
    fn version_negotiation() {
        assert!(check_api_version(&Version::new(1, 0, 0)).is_ok());
        assert!(check_api_version(&Version::new(1, 4, 2)).is_ok());
        assert!(matches!(
            check_api_version(&Version::new(2, 0, 0)),
            Err(AutomationError::IncompatibleApiVersion { .. })
        ));
        assert!(check_api_version(&Version::new(0, 9, 0)).is_err());
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let err = resolve_application_path(Some(Path::new("/definitely/not/Logic"))).unwrap_err();
        assert!(matches!(err, AutomationError::Launch(_)));
    }

    #[test]
    fn relative_paths_are_made_absolute() {
        let path = absolute_path(Path::new("capture.sal")).unwrap();
        assert!(Path::new(&path).is_absolute());
        assert!(path.ends_with("capture.sal"));
    }

    #[tokio::test]
    async fn connect_times_out_without_server() {
        // Bind and drop to find a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let started = std::time::Instant::now();
        let err = Manager::connect(ConnectOptions::local(port).with_timeout(Duration::from_millis(300)))
            .await
            .unwrap_err();

        assert!(matches!(err, AutomationError::ConnectionTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
