//! Routing service IPC client
//!
//! System routes are installed by a privileged, long-lived service that is
//! not part of this process tree; the desktop app never holds the
//! privileges itself. This client speaks a small JSON request/response
//! protocol to that service over the OS-native local channel (a Unix
//! domain socket, or a named pipe on Windows).
//!
//! If the channel cannot be opened the service is assumed to be stopped:
//! the client runs the platform elevation prompt to (re)start it and then
//! retries the original request exactly once. An explicit denial of the
//! prompt is surfaced as its own error, distinct from a generic IPC
//! failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

use thiserror::Error;

/// Success status in a service response
pub const STATUS_SUCCESS: i32 = 0;
/// Generic failure status; `errorMessage` carries the detail
pub const STATUS_GENERIC_FAILURE: i32 = 1;
/// The host's routing table cannot be managed by the service at all
pub const STATUS_UNSUPPORTED_ROUTING_TABLE: i32 = 2;

/// Default IPC round-trip timeout (milliseconds)
pub const DEFAULT_IPC_TIMEOUT_MS: u64 = 10_000;

#[cfg(unix)]
/// Default endpoint of the privileged routing service
pub const DEFAULT_SERVICE_ENDPOINT: &str = "/var/run/outrigger/routing-service.sock";
#[cfg(windows)]
pub const DEFAULT_SERVICE_ENDPOINT: &str = r"\\.\pipe\OutriggerRoutingService";

/// Errors produced by the routing client
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// The IPC channel could not be established
    #[error("routing service channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The user declined the elevation prompt
    #[error("administrator permissions were denied")]
    NoAdminPermissions,

    /// The service reported it cannot manage this routing table (fatal)
    #[error("the system routing table is unsupported")]
    UnsupportedRoutingTable,

    /// The service reported a failure status
    #[error("routing service failure (status {code}): {message}")]
    ServiceFailure { code: i32, message: String },

    /// `reset_routing` was called with no prior successful configuration
    #[error("routing was never configured")]
    NotConfigured,

    /// The system default gateway could not be determined
    #[error("could not determine the default gateway: {0}")]
    GatewayDiscovery(String),

    /// The IPC round trip did not complete in time
    #[error("routing service request timed out")]
    Timeout,

    /// Transport-level failure on an established channel
    #[error("routing service IO error: {0}")]
    Io(String),

    /// The service response could not be decoded
    #[error("routing service protocol error: {0}")]
    Protocol(String),
}

/// Request sent to the privileged service
///
/// Serializes to `{"action": "...", "parameters": {...}}`, one message per
/// line; the schema is a compatibility contract with the installed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "camelCase")]
pub enum RoutingRequest {
    #[serde(rename_all = "camelCase")]
    ConfigureRouting { router_ip: String, proxy_ip: String },
    #[serde(rename_all = "camelCase")]
    ResetRouting {
        proxy_ip: String,
        previous_gateway: String,
    },
}

/// Response from the privileged service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingResponse {
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// State needed to invert a successful `configure_routing`
///
/// Owned by the client instance, never read from ambient scope. `reset`
/// fails fast locally when this was never captured.
#[derive(Debug, Clone)]
struct RoutingState {
    previous_gateway: String,
    proxy_server_ip: String,
}

/// Outcome of the platform elevation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationOutcome {
    Accepted,
    Denied,
}

/// Seam for (re)starting the privileged service via an elevation prompt
#[async_trait]
pub trait ServiceElevator: Send + Sync {
    async fn restart_service(&self) -> Result<ElevationOutcome, RoutingError>;
}

/// Elevator using the platform's graphical privilege prompt
#[derive(Debug, Clone)]
pub struct PlatformElevator {
    start_command: Vec<String>,
}

impl PlatformElevator {
    pub fn new(start_command: Vec<String>) -> Self {
        Self { start_command }
    }
}

impl Default for PlatformElevator {
    fn default() -> Self {
        #[cfg(unix)]
        let start_command = vec![
            "systemctl".to_string(),
            "start".to_string(),
            "outrigger-routing.service".to_string(),
        ];
        #[cfg(windows)]
        let start_command = vec![
            "sc.exe".to_string(),
            "start".to_string(),
            "OutriggerRoutingService".to_string(),
        ];
        Self { start_command }
    }
}

#[async_trait]
impl ServiceElevator for PlatformElevator {
    #[cfg(unix)]
    async fn restart_service(&self) -> Result<ElevationOutcome, RoutingError> {
        debug!("requesting elevation: pkexec {:?}", self.start_command);
        let status = tokio::process::Command::new("pkexec")
            .args(&self.start_command)
            .status()
            .await
            .map_err(|e| RoutingError::Io(format!("failed to run pkexec: {e}")))?;

        if status.success() {
            return Ok(ElevationOutcome::Accepted);
        }
        // pkexec exits 126 when the dialog is dismissed and 127 when the
        // user is not authorized.
        match status.code() {
            Some(126) | Some(127) => Ok(ElevationOutcome::Denied),
            code => Err(RoutingError::Io(format!(
                "service start command failed (status {code:?})"
            ))),
        }
    }

    #[cfg(windows)]
    async fn restart_service(&self) -> Result<ElevationOutcome, RoutingError> {
        let (file, args) = self
            .start_command
            .split_first()
            .ok_or_else(|| RoutingError::Io("empty service start command".to_string()))?;
        let argument_list = args.join(",");
        debug!("requesting elevation for {} {}", file, argument_list);

        let status = tokio::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                &format!(
                    "Start-Process -FilePath '{file}' -ArgumentList '{argument_list}' -Verb RunAs -Wait"
                ),
            ])
            .status()
            .await
            .map_err(|e| RoutingError::Io(format!("failed to run powershell: {e}")))?;

        // Start-Process throws (non-zero exit) when the UAC prompt is
        // declined.
        if status.success() {
            Ok(ElevationOutcome::Accepted)
        } else {
            Ok(ElevationOutcome::Denied)
        }
    }
}

/// Controller-facing seam over the routing service
#[async_trait]
pub trait RoutingService: Send + Sync {
    /// Route all traffic through the virtual router at `router_ip`,
    /// exempting the remote proxy server at `proxy_ip`.
    async fn configure_routing(
        &mut self,
        router_ip: &str,
        proxy_ip: &str,
    ) -> Result<(), RoutingError>;

    /// Undo a prior `configure_routing`. Fails fast, without contacting
    /// the service, when nothing was configured.
    async fn reset_routing(&mut self) -> Result<(), RoutingError>;
}

/// IPC client for the privileged routing service
pub struct RoutingServiceClient {
    endpoint: String,
    limit: Duration,
    elevator: Box<dyn ServiceElevator>,
    gateway_override: Option<String>,
    state: Option<RoutingState>,
}

impl RoutingServiceClient {
    pub fn new(elevator: Box<dyn ServiceElevator>) -> Self {
        Self {
            endpoint: DEFAULT_SERVICE_ENDPOINT.to_string(),
            limit: Duration::from_millis(DEFAULT_IPC_TIMEOUT_MS),
            elevator,
            gateway_override: None,
            state: None,
        }
    }

    /// Point the client at a non-default service endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Skip gateway discovery and use a fixed previous-gateway value, for
    /// hosts where route enumeration is unreliable
    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway_override = Some(gateway.into());
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }

    #[cfg(unix)]
    async fn open_channel(&self) -> std::io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.endpoint).await
    }

    #[cfg(windows)]
    async fn open_channel(
        &self,
    ) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(&self.endpoint)
    }

    async fn exchange(&self, request: &RoutingRequest) -> Result<RoutingResponse, RoutingError> {
        let stream = self
            .open_channel()
            .await
            .map_err(|e| RoutingError::ChannelUnavailable(e.to_string()))?;

        timeout(self.limit, round_trip(stream, request))
            .await
            .map_err(|_| RoutingError::Timeout)?
    }

    /// Send `request`, starting the service through the elevation prompt
    /// and retrying exactly once if the channel was unavailable.
    async fn send_request(&self, request: &RoutingRequest) -> Result<(), RoutingError> {
        match self.exchange(request).await {
            Ok(response) => check_status(response),
            Err(RoutingError::ChannelUnavailable(reason)) => {
                debug!("routing service unavailable ({reason}), prompting for elevation");
                match self.elevator.restart_service().await? {
                    ElevationOutcome::Denied => Err(RoutingError::NoAdminPermissions),
                    ElevationOutcome::Accepted => {
                        let response = self.exchange(request).await?;
                        check_status(response)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn previous_gateway(&self) -> Result<String, RoutingError> {
        match &self.gateway_override {
            Some(gateway) => Ok(gateway.clone()),
            None => discover_default_gateway().await,
        }
    }
}

#[async_trait]
impl RoutingService for RoutingServiceClient {
    async fn configure_routing(
        &mut self,
        router_ip: &str,
        proxy_ip: &str,
    ) -> Result<(), RoutingError> {
        // Captured before the request so reset never depends on the
        // already-rewritten routing table.
        let previous_gateway = self.previous_gateway().await?;

        let request = RoutingRequest::ConfigureRouting {
            router_ip: router_ip.to_string(),
            proxy_ip: proxy_ip.to_string(),
        };
        self.send_request(&request).await?;

        self.state = Some(RoutingState {
            previous_gateway,
            proxy_server_ip: proxy_ip.to_string(),
        });
        Ok(())
    }

    async fn reset_routing(&mut self) -> Result<(), RoutingError> {
        let state = self.state.take().ok_or(RoutingError::NotConfigured)?;

        let request = RoutingRequest::ResetRouting {
            proxy_ip: state.proxy_server_ip,
            previous_gateway: state.previous_gateway,
        };
        self.send_request(&request).await
    }
}

async fn round_trip<S>(stream: S, request: &RoutingRequest) -> Result<RoutingResponse, RoutingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut payload = serde_json::to_vec(request)
        .map_err(|e| RoutingError::Protocol(format!("serialize request: {e}")))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .await
        .map_err(|e| RoutingError::Io(format!("write request: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| RoutingError::Io(format!("flush request: {e}")))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| RoutingError::Io(format!("read response: {e}")))?;
    if line.trim().is_empty() {
        return Err(RoutingError::Io(
            "empty response from routing service".to_string(),
        ));
    }

    serde_json::from_str(&line).map_err(|e| RoutingError::Protocol(format!("decode response: {e}")))
}

fn check_status(response: RoutingResponse) -> Result<(), RoutingError> {
    match response.status_code {
        STATUS_SUCCESS => Ok(()),
        STATUS_UNSUPPORTED_ROUTING_TABLE => Err(RoutingError::UnsupportedRoutingTable),
        code => {
            let message = response.error_message.unwrap_or_default();
            warn!("routing service returned status {}: {}", code, message);
            Err(RoutingError::ServiceFailure { code, message })
        }
    }
}

/// Find the current system default gateway so it can be restored later
async fn discover_default_gateway() -> Result<String, RoutingError> {
    #[cfg(target_os = "linux")]
    {
        let output = tokio::process::Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .await
            .map_err(|e| RoutingError::GatewayDiscovery(e.to_string()))?;
        parse_ip_route_default(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| RoutingError::GatewayDiscovery("no default route".to_string()))
    }

    #[cfg(target_os = "macos")]
    {
        let output = tokio::process::Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .await
            .map_err(|e| RoutingError::GatewayDiscovery(e.to_string()))?;
        parse_route_get_default(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| RoutingError::GatewayDiscovery("no default route".to_string()))
    }

    #[cfg(windows)]
    {
        let output = tokio::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "(Get-NetRoute -DestinationPrefix '0.0.0.0/0' | Sort-Object RouteMetric | Select-Object -First 1).NextHop",
            ])
            .output()
            .await
            .map_err(|e| RoutingError::GatewayDiscovery(e.to_string()))?;
        let gateway = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if gateway.is_empty() {
            Err(RoutingError::GatewayDiscovery(
                "no default route".to_string(),
            ))
        } else {
            Ok(gateway)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Err(RoutingError::GatewayDiscovery(
            "unsupported platform".to_string(),
        ))
    }
}

/// Parse `ip route show default` output: "default via 192.168.1.1 dev eth0"
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ip_route_default(output: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "via" {
                return tokens.next().map(|s| s.to_string());
            }
        }
    }
    None
}

/// Parse `route -n get default` output: "    gateway: 192.168.1.1"
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_route_get_default(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("gateway:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}
