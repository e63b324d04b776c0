//! Child process supervision
//!
//! The two helper binaries (Shadowsocks local proxy, SOCKS-to-TUN bridge)
//! expose no IPC contract of their own: there is no "ready" signal, only a
//! failure signal. A spawn that does not error immediately is treated as
//! provisional success and the next pipeline stage acts as the readiness
//! gate. A monitor task watches each child and reports an exit that we did
//! not request, so the controller can treat it as an unsolicited disconnect.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, Result};

/// Which supervised helper process a handle or exit event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The Shadowsocks client exposing the local SOCKS5 endpoint
    LocalProxy,
    /// The SOCKS-to-TUN bridge backing the virtual interface
    Tunnel,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::LocalProxy => write!(f, "local proxy"),
            ProcessKind::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Notification sent when a supervised child exits without being stopped
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub kind: ProcessKind,
    pub code: Option<i32>,
}

/// Owned handle to a supervised child process
///
/// At most one handle exists per process kind at a time; the lifecycle
/// controller owns it exclusively until teardown. Dropping the handle kills
/// the child (kill-on-drop), but the normal path is an explicit `stop`.
pub struct ProcessHandle {
    kind: ProcessKind,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl ProcessHandle {
    /// OS pid of the child, if it was still known at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    /// Kill the child and wait for the monitor to wind down
    ///
    /// An exit caused by this call is never reported as unsolicited.
    pub async fn stop(mut self) {
        debug!("stopping {} process (pid {:?})", self.kind, self.pid);
        if let Some(tx) = self.stop_tx.take() {
            // The monitor may already be gone if the child exited on its own.
            let _ = tx.send(());
        }
        if let Err(e) = self.monitor.await {
            warn!("{} monitor task failed: {}", self.kind, e);
        }
    }

    /// Handle with no real child behind it, for controller tests; `stopped`
    /// flips when `stop` is called
    #[cfg(test)]
    pub(crate) fn stub_with_signal(
        kind: ProcessKind,
        stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(async move {
            if stop_rx.await.is_ok() {
                stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
        Self {
            kind,
            pid: None,
            stop_tx: Some(stop_tx),
            monitor,
        }
    }
}

/// Spawn `binary` with `args` and register an exit watcher
///
/// The watcher sends on `exit_tx` only for exits we did not request.
pub(crate) fn spawn_supervised(
    kind: ProcessKind,
    binary: &Path,
    args: &[String],
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
) -> Result<ProcessHandle> {
    debug!("spawning {} process: {} {:?}", kind, binary.display(), args);

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Process(format!("failed to spawn {kind}: {e}")))?;

    let pid = child.id();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(kind, stderr));
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let monitor = tokio::spawn(monitor_child(kind, child, stop_rx, exit_tx));

    Ok(ProcessHandle {
        kind,
        pid,
        stop_tx: Some(stop_tx),
        monitor,
    })
}

async fn monitor_child(
    kind: ProcessKind,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.as_ref().ok().and_then(|s| s.code());
            warn!("{} process exited unexpectedly (code {:?})", kind, code);
            // The receiver may be gone during shutdown; nothing to do then.
            let _ = exit_tx.send(ProcessExit { kind, code });
        }
        _ = &mut stop_rx => {
            if let Err(e) = child.kill().await {
                warn!("failed to kill {} process: {}", kind, e);
            }
        }
    }
}

async fn forward_stderr(kind: ProcessKind, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            debug!("{} stderr: {}", kind, trimmed);
        }
    }
}

/// Seam for starting the local Shadowsocks proxy process
#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    async fn start(
        &self,
        config: &ServerConfig,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<ProcessHandle>;
}

/// Launcher for the bundled Shadowsocks client binary
#[derive(Debug, Clone)]
pub struct ShadowsocksProxyLauncher {
    binary: PathBuf,
    local_port: u16,
}

impl ShadowsocksProxyLauncher {
    pub fn new(binary: PathBuf, local_port: u16) -> Self {
        Self { binary, local_port }
    }

    /// argv for the Shadowsocks client; the flags are a compatibility
    /// contract with the bundled binary
    fn build_args(&self, config: &ServerConfig) -> Vec<String> {
        vec![
            "-l".to_string(),
            self.local_port.to_string(),
            "-s".to_string(),
            config.host.clone(),
            "-p".to_string(),
            config.port.to_string(),
            "-k".to_string(),
            config.password.clone(),
            "-m".to_string(),
            config.method.clone(),
            "-u".to_string(),
        ]
    }
}

#[async_trait]
impl ProxyLauncher for ShadowsocksProxyLauncher {
    async fn start(
        &self,
        config: &ServerConfig,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<ProcessHandle> {
        let args = self.build_args(config);
        spawn_supervised(ProcessKind::LocalProxy, &self.binary, &args, exits)
    }
}

/// Fixed virtual network the tunnel device is configured with
///
/// The subnet is deliberately obscure so it does not collide with common
/// LAN ranges.
#[derive(Debug, Clone)]
pub struct TunDeviceConfig {
    pub driver: String,
    pub device_name: String,
    pub device_ip: String,
    pub network: String,
    pub netmask: String,
    pub router_ip: String,
}

impl Default for TunDeviceConfig {
    fn default() -> Self {
        Self {
            driver: "tap0901".to_string(),
            device_name: "outrigger-tap0".to_string(),
            device_ip: "10.0.85.2".to_string(),
            network: "10.0.85.0".to_string(),
            netmask: "255.255.255.0".to_string(),
            router_ip: "10.0.85.1".to_string(),
        }
    }
}

/// Seam for starting the SOCKS-to-TUN bridge process
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn start(
        &self,
        socks_addr: &str,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<ProcessHandle>;
}

/// Launcher for the bundled tun2socks binary
#[derive(Debug, Clone)]
pub struct Tun2socksLauncher {
    binary: PathBuf,
    device: TunDeviceConfig,
}

impl Tun2socksLauncher {
    pub fn new(binary: PathBuf, device: TunDeviceConfig) -> Self {
        Self { binary, device }
    }

    pub fn device(&self) -> &TunDeviceConfig {
        &self.device
    }

    fn build_args(&self, socks_addr: &str) -> Vec<String> {
        let d = &self.device;
        vec![
            "--tundev".to_string(),
            format!(
                "{}:{}:{}:{}:{}",
                d.driver, d.device_name, d.device_ip, d.network, d.netmask
            ),
            "--netif-ipaddr".to_string(),
            d.router_ip.clone(),
            "--netif-netmask".to_string(),
            d.netmask.clone(),
            "--socks-server-addr".to_string(),
            socks_addr.to_string(),
            "--socks5-udp".to_string(),
            "--udp-relay-addr".to_string(),
            socks_addr.to_string(),
        ]
    }
}

#[async_trait]
impl TunnelLauncher for Tun2socksLauncher {
    async fn start(
        &self,
        socks_addr: &str,
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<ProcessHandle> {
        let args = self.build_args(socks_addr);
        spawn_supervised(ProcessKind::Tunnel, &self.binary, &args, exits)
    }
}
