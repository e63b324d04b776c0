//! Connection lifecycle controller
//!
//! A sequential pipeline that turns a bare server credential set into a
//! system-wide tunnel, and safely reverses it. The stage order is
//! load-bearing: reachability is checked before any process is spawned
//! (cheap fail fast), credentials are validated before the tunnel device
//! exists, and routing is configured last because it is the only stage
//! with system-wide side effects.
//!
//! Any stage failure is translated to the closed `ErrorCode` taxonomy and
//! everything already started in the attempt is torn down. Teardown is
//! idempotent and never fails: it runs from error-recovery and shutdown
//! paths where there is no one left to handle another failure.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, TunnelConfig};
use crate::credentials::CredentialCheck;
use crate::error::{AppError, ErrorCode, Result};
use crate::events::EventSink;
use crate::process::{ProcessExit, ProcessHandle, ProcessKind, ProxyLauncher, TunnelLauncher};
use crate::reachability::ReachabilityProbe;
use crate::routing::{RoutingError, RoutingService};
use crate::store::{ConnectionRecord, ConnectionStore};

/// Where the connection lifecycle currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    ReachabilityCheck,
    StartingProxy,
    ValidatingCredentials,
    StartingTunnel,
    ConfiguringRoutes,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::ReachabilityCheck => "checking reachability",
            ConnectionStatus::StartingProxy => "starting local proxy",
            ConnectionStatus::ValidatingCredentials => "validating credentials",
            ConnectionStatus::StartingTunnel => "starting tunnel",
            ConnectionStatus::ConfiguringRoutes => "configuring routes",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
        };
        write!(f, "{name}")
    }
}

/// The pipeline components the controller drives, behind their seams
pub struct Components {
    pub probe: Arc<dyn ReachabilityProbe>,
    pub proxy_launcher: Arc<dyn ProxyLauncher>,
    pub validator: Arc<dyn CredentialCheck>,
    pub tunnel_launcher: Arc<dyn TunnelLauncher>,
    pub routing: Box<dyn RoutingService>,
    pub store: Arc<dyn ConnectionStore>,
    pub events: Arc<dyn EventSink>,
}

/// Resources owned exclusively by the controller for the active attempt
struct Resources {
    routing: Box<dyn RoutingService>,
    proxy: Option<ProcessHandle>,
    tunnel: Option<ProcessHandle>,
    record_id: Option<String>,
}

/// Orchestrator for the connect/disconnect lifecycle
///
/// Only one connection attempt may be in flight at a time; a second
/// `connect` while any attempt or connection is active is rejected without
/// side effects.
pub struct ConnectionController {
    config: TunnelConfig,
    router_ip: String,
    probe: Arc<dyn ReachabilityProbe>,
    proxy_launcher: Arc<dyn ProxyLauncher>,
    validator: Arc<dyn CredentialCheck>,
    tunnel_launcher: Arc<dyn TunnelLauncher>,
    store: Arc<dyn ConnectionStore>,
    events: Arc<dyn EventSink>,
    status: StdMutex<ConnectionStatus>,
    interrupted: StdMutex<Option<ProcessExit>>,
    resources: Mutex<Resources>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
}

impl ConnectionController {
    /// Create the controller and start its exit watcher
    ///
    /// `router_ip` is the virtual router address of the tunnel device; it
    /// is what system routes are pointed at.
    pub fn new(config: TunnelConfig, router_ip: String, components: Components) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(Self {
            config,
            router_ip,
            probe: components.probe,
            proxy_launcher: components.proxy_launcher,
            validator: components.validator,
            tunnel_launcher: components.tunnel_launcher,
            store: components.store,
            events: components.events,
            status: StdMutex::new(ConnectionStatus::Disconnected),
            interrupted: StdMutex::new(None),
            resources: Mutex::new(Resources {
                routing: components.routing,
                proxy: None,
                tunnel: None,
                record_id: None,
            }),
            exit_tx,
        });

        tokio::spawn(watch_exits(Arc::downgrade(&controller), exit_rx));
        controller
    }

    /// Current lifecycle state
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Establish a tunnel to `config`'s server
    ///
    /// Runs the stage pipeline in strict order, persisting the connection
    /// record only once CONNECTED is reached. On any stage failure the
    /// surfaced error is the failed stage's `ErrorCode`; whatever the
    /// attempt already started is stopped again.
    pub async fn connect(&self, config: ServerConfig) -> Result<ConnectionRecord> {
        self.begin_attempt()?;
        info!("connecting to {}", config.display_name());
        self.emit_status(ConnectionStatus::ReachabilityCheck).await;

        let mut resources = self.resources.lock().await;
        match self.run_pipeline(&config, &mut resources).await {
            Ok(record) => {
                resources.record_id = Some(record.id.clone());
                self.set_status(ConnectionStatus::Connected);
                self.emit_status(ConnectionStatus::Connected).await;
                info!("connected to {}", config.display_name());
                Ok(record)
            }
            Err(code) => {
                warn!("connect to {} failed: {}", config.display_name(), code);
                self.teardown(&mut resources).await;
                self.set_status(ConnectionStatus::Disconnected);
                self.emit_status(ConnectionStatus::Disconnected).await;
                Err(AppError::Connect(code))
            }
        }
    }

    /// Tear the tunnel down
    ///
    /// Idempotent and infallible: calling it with nothing running is a
    /// safe no-op, and every teardown step is best-effort.
    pub async fn disconnect(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == ConnectionStatus::Disconnected {
                debug!("disconnect requested while already disconnected");
                return;
            }
            *status = ConnectionStatus::Disconnecting;
        }
        self.emit_status(ConnectionStatus::Disconnecting).await;

        let mut resources = self.resources.lock().await;
        self.teardown(&mut resources).await;
        self.set_status(ConnectionStatus::Disconnected);
        self.emit_status(ConnectionStatus::Disconnected).await;
        info!("disconnected");
    }

    fn begin_attempt(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        if *status != ConnectionStatus::Disconnected {
            return Err(AppError::ConnectionInProgress);
        }
        *status = ConnectionStatus::ReachabilityCheck;
        *self.interrupted.lock().unwrap() = None;
        Ok(())
    }

    async fn run_pipeline(
        &self,
        config: &ServerConfig,
        resources: &mut Resources,
    ) -> std::result::Result<ConnectionRecord, ErrorCode> {
        let reachable = self
            .probe
            .is_reachable(&config.host, config.port, self.config.reachability_timeout)
            .await;
        if !reachable {
            return Err(ErrorCode::ServerUnreachable);
        }
        self.check_interrupted()?;

        self.advance(ConnectionStatus::StartingProxy).await;
        let proxy = self
            .proxy_launcher
            .start(config, self.exit_tx.clone())
            .await
            .map_err(|e| {
                warn!("local proxy start failed: {}", e);
                ErrorCode::ShadowsocksStartFailure
            })?;
        resources.proxy = Some(proxy);
        self.check_interrupted()?;

        self.advance(ConnectionStatus::ValidatingCredentials).await;
        let proxy_addr = self.config.local_proxy_addr();
        match self.validator.validate(&proxy_addr).await {
            Ok(true) => {}
            Ok(false) => return Err(ErrorCode::InvalidServerCredentials),
            Err(e) => {
                warn!("credential probe failed: {}", e);
                return Err(ErrorCode::InvalidServerCredentials);
            }
        }
        self.check_interrupted()?;

        self.advance(ConnectionStatus::StartingTunnel).await;
        let tunnel = self
            .tunnel_launcher
            .start(&proxy_addr, self.exit_tx.clone())
            .await
            .map_err(|e| {
                warn!("tunnel start failed: {}", e);
                ErrorCode::HttpProxyStartFailure
            })?;
        resources.tunnel = Some(tunnel);
        // The virtual interface may not be configured by the OS yet even
        // though the process is up.
        tokio::time::sleep(self.config.settle_delay).await;
        self.check_interrupted()?;

        self.advance(ConnectionStatus::ConfiguringRoutes).await;
        let proxy_ip = resolve_server_ip(&config.host, config.port)
            .await
            .map_err(|e| {
                warn!("failed to resolve server address: {}", e);
                ErrorCode::ConfigureSystemProxyFailure
            })?;
        resources
            .routing
            .configure_routing(&self.router_ip, &proxy_ip)
            .await
            .map_err(map_routing_error)?;
        self.check_interrupted()?;

        let record = ConnectionRecord::new(config.clone());
        if let Err(e) = self.store.save(&record).await {
            // A working tunnel beats a persisted record.
            warn!("failed to persist connection record: {}", e);
        }
        Ok(record)
    }

    /// Reverse of the pipeline: routes, tunnel, proxy, record. Every step
    /// logs and continues on failure.
    async fn teardown(&self, resources: &mut Resources) {
        match resources.routing.reset_routing().await {
            Ok(()) => {}
            Err(RoutingError::NotConfigured) => debug!("no routing state to reset"),
            Err(e) => warn!("failed to reset routing: {}", e),
        }
        if let Some(tunnel) = resources.tunnel.take() {
            tunnel.stop().await;
        }
        if let Some(proxy) = resources.proxy.take() {
            proxy.stop().await;
        }
        resources.record_id = None;
        if let Err(e) = self.store.clear().await {
            warn!("failed to clear connection record: {}", e);
        }
    }

    /// A supervised process died on its own; treat it exactly like a
    /// disconnect request, then tell the caller it was not one.
    async fn handle_unexpected_exit(&self, exit: ProcessExit) {
        warn!(
            "{} process exited unexpectedly (code {:?})",
            exit.kind, exit.code
        );
        *self.interrupted.lock().unwrap() = Some(exit);

        let mut resources = self.resources.lock().await;
        if self.status() != ConnectionStatus::Connected {
            // An in-flight attempt observes the interruption at its next
            // stage boundary; a finished one already cleaned up.
            debug!("unsolicited exit outside CONNECTED, leaving to the pipeline");
            return;
        }

        let record_id = resources.record_id.clone().unwrap_or_default();
        self.set_status(ConnectionStatus::Disconnecting);
        self.emit_status(ConnectionStatus::Disconnecting).await;
        self.teardown(&mut resources).await;
        self.set_status(ConnectionStatus::Disconnected);
        self.emit_status(ConnectionStatus::Disconnected).await;

        if let Err(e) = self.events.connection_lost(&record_id).await {
            warn!("failed to emit connection-lost event: {}", e);
        }
    }

    /// Abort the attempt if a supervised process died mid-pipeline
    fn check_interrupted(&self) -> std::result::Result<(), ErrorCode> {
        match *self.interrupted.lock().unwrap() {
            Some(exit) => Err(match exit.kind {
                ProcessKind::LocalProxy => ErrorCode::ShadowsocksStartFailure,
                ProcessKind::Tunnel => ErrorCode::HttpProxyStartFailure,
            }),
            None => Ok(()),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    async fn advance(&self, status: ConnectionStatus) {
        self.set_status(status);
        self.emit_status(status).await;
    }

    async fn emit_status(&self, status: ConnectionStatus) {
        if let Err(e) = self.events.connection_status_changed(status).await {
            warn!("failed to emit status event: {}", e);
        }
    }
}

async fn watch_exits(
    controller: Weak<ConnectionController>,
    mut exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
) {
    while let Some(exit) = exit_rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_unexpected_exit(exit).await;
    }
}

fn map_routing_error(e: RoutingError) -> ErrorCode {
    match e {
        RoutingError::NoAdminPermissions => ErrorCode::NoAdminPermissions,
        RoutingError::UnsupportedRoutingTable => ErrorCode::UnsupportedRoutingTable,
        other => {
            warn!("routing configuration failed: {}", other);
            ErrorCode::ConfigureSystemProxyFailure
        }
    }
}

/// Resolve the server host to the IP the routing service must exempt
async fn resolve_server_ip(host: &str, port: u16) -> std::io::Result<String> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .map(|a| a.ip().to_string())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_server_config() -> ServerConfig {
        ServerConfig {
            host: "203.0.113.7".to_string(),
            port: 8388,
            password: "secret".to_string(),
            method: "chacha20-ietf-poly1305".to_string(),
            name: Some("Test".to_string()),
        }
    }

    fn test_tunnel_config() -> TunnelConfig {
        TunnelConfig {
            settle_delay: Duration::ZERO,
            ..TunnelConfig::default()
        }
    }

    #[derive(Default)]
    struct Trace {
        stages: StdMutex<Vec<&'static str>>,
    }

    impl Trace {
        fn push(&self, stage: &'static str) {
            self.stages.lock().unwrap().push(stage);
        }
        fn stages(&self) -> Vec<&'static str> {
            self.stages.lock().unwrap().clone()
        }
    }

    struct FakeProbe {
        reachable: bool,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn is_reachable(&self, _host: &str, _port: u16, _limit: Duration) -> bool {
            self.trace.push("probe");
            self.reachable
        }
    }

    struct FakeProxyLauncher {
        fail: bool,
        starts: AtomicUsize,
        stopped: Arc<AtomicBool>,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl ProxyLauncher for FakeProxyLauncher {
        async fn start(
            &self,
            _config: &ServerConfig,
            _exits: mpsc::UnboundedSender<ProcessExit>,
        ) -> Result<ProcessHandle> {
            self.trace.push("proxy");
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Process("spawn failed".to_string()));
            }
            Ok(ProcessHandle::stub_with_signal(
                ProcessKind::LocalProxy,
                self.stopped.clone(),
            ))
        }
    }

    struct FakeValidator {
        valid: bool,
        delay: Duration,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl CredentialCheck for FakeValidator {
        async fn validate(&self, _proxy_addr: &str) -> Result<bool> {
            self.trace.push("validate");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.valid)
        }
    }

    struct FakeTunnelLauncher {
        fail: bool,
        starts: AtomicUsize,
        stopped: Arc<AtomicBool>,
        exit_tx: StdMutex<Option<mpsc::UnboundedSender<ProcessExit>>>,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl TunnelLauncher for FakeTunnelLauncher {
        async fn start(
            &self,
            _socks_addr: &str,
            exits: mpsc::UnboundedSender<ProcessExit>,
        ) -> Result<ProcessHandle> {
            self.trace.push("tunnel");
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Process("spawn failed".to_string()));
            }
            *self.exit_tx.lock().unwrap() = Some(exits);
            Ok(ProcessHandle::stub_with_signal(
                ProcessKind::Tunnel,
                self.stopped.clone(),
            ))
        }
    }

    struct FakeRouting {
        fail_with: Option<RoutingError>,
        configures: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl RoutingService for FakeRouting {
        async fn configure_routing(
            &mut self,
            _router_ip: &str,
            _proxy_ip: &str,
        ) -> std::result::Result<(), RoutingError> {
            self.trace.push("configure");
            self.configures.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn reset_routing(&mut self) -> std::result::Result<(), RoutingError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        record: StdMutex<Option<ConnectionRecord>>,
        saves: AtomicUsize,
        clears: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionStore for FakeStore {
        async fn save(&self, record: &ConnectionRecord) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.record.lock().unwrap() = Some(record.clone());
            Ok(())
        }

        async fn load(&self) -> Result<ConnectionRecord> {
            self.record
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AppError::Storage("no record".to_string()))
        }

        async fn clear(&self) -> Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            *self.record.lock().unwrap() = None;
            Ok(())
        }

        fn has_connection(&self) -> bool {
            self.record.lock().unwrap().is_some()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        statuses: StdMutex<Vec<ConnectionStatus>>,
        lost: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn connection_status_changed(
            &self,
            status: ConnectionStatus,
        ) -> std::result::Result<(), String> {
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }

        async fn connection_lost(&self, record_id: &str) -> std::result::Result<(), String> {
            self.lost.lock().unwrap().push(record_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        controller: Arc<ConnectionController>,
        trace: Arc<Trace>,
        proxy: Arc<FakeProxyLauncher>,
        tunnel: Arc<FakeTunnelLauncher>,
        configures: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        store: Arc<FakeStore>,
        sink: Arc<RecordingSink>,
    }

    #[derive(Default)]
    struct HarnessOpts {
        unreachable: bool,
        proxy_fails: bool,
        invalid_credentials: bool,
        tunnel_fails: bool,
        validator_delay: Duration,
        routing_fails_with: Option<RoutingError>,
    }

    fn harness(opts: HarnessOpts) -> Harness {
        let trace = Arc::new(Trace::default());
        let proxy = Arc::new(FakeProxyLauncher {
            fail: opts.proxy_fails,
            starts: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            trace: trace.clone(),
        });
        let tunnel = Arc::new(FakeTunnelLauncher {
            fail: opts.tunnel_fails,
            starts: AtomicUsize::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            exit_tx: StdMutex::new(None),
            trace: trace.clone(),
        });
        let configures = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FakeStore::default());
        let sink = Arc::new(RecordingSink::default());

        let components = Components {
            probe: Arc::new(FakeProbe {
                reachable: !opts.unreachable,
                trace: trace.clone(),
            }),
            proxy_launcher: proxy.clone(),
            validator: Arc::new(FakeValidator {
                valid: !opts.invalid_credentials,
                delay: opts.validator_delay,
                trace: trace.clone(),
            }),
            tunnel_launcher: tunnel.clone(),
            routing: Box::new(FakeRouting {
                fail_with: opts.routing_fails_with,
                configures: configures.clone(),
                resets: resets.clone(),
                trace: trace.clone(),
            }),
            store: store.clone(),
            events: sink.clone(),
        };

        let controller =
            ConnectionController::new(test_tunnel_config(), "10.0.85.1".to_string(), components);

        Harness {
            controller,
            trace,
            proxy,
            tunnel,
            configures,
            resets,
            store,
            sink,
        }
    }

    async fn wait_for_status(controller: &ConnectionController, expected: ConnectionStatus) {
        for _ in 0..250 {
            if controller.status() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for status {expected:?}");
    }

    fn connect_error(result: Result<ConnectionRecord>) -> ErrorCode {
        match result {
            Err(AppError::Connect(code)) => code,
            other => panic!("expected a stage failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scenario_a_full_success_in_order() {
        let h = harness(HarnessOpts::default());
        let config = test_server_config();

        let record = h.controller.connect(config.clone()).await.unwrap();

        // P1: strict stage order.
        assert_eq!(
            h.trace.stages(),
            vec!["probe", "proxy", "validate", "tunnel", "configure"]
        );
        assert_eq!(h.controller.status(), ConnectionStatus::Connected);
        assert_eq!(record.config, config);

        // The record is persisted exactly once, with the exact config.
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.load().await.unwrap().config, config);

        let statuses = h.sink.statuses.lock().unwrap().clone();
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::ReachabilityCheck,
                ConnectionStatus::StartingProxy,
                ConnectionStatus::ValidatingCredentials,
                ConnectionStatus::StartingTunnel,
                ConnectionStatus::ConfiguringRoutes,
                ConnectionStatus::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_scenario_b_unreachable_spawns_nothing() {
        let h = harness(HarnessOpts {
            unreachable: true,
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);

        assert_eq!(code, ErrorCode::ServerUnreachable);
        assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.tunnel.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.configures.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_proxy_spawn_failure() {
        let h = harness(HarnessOpts {
            proxy_fails: true,
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);

        assert_eq!(code, ErrorCode::ShadowsocksStartFailure);
        assert_eq!(h.tunnel.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.trace.stages(), vec!["probe", "proxy"]);
    }

    #[tokio::test]
    async fn test_scenario_c_invalid_credentials_stops_proxy() {
        let h = harness(HarnessOpts {
            invalid_credentials: true,
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);

        assert_eq!(code, ErrorCode::InvalidServerCredentials);
        // The proxy started during the attempt is stopped again.
        assert!(h.proxy.stopped.load(Ordering::SeqCst));
        assert_eq!(h.tunnel.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tunnel_spawn_failure() {
        let h = harness(HarnessOpts {
            tunnel_fails: true,
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);

        assert_eq!(code, ErrorCode::HttpProxyStartFailure);
        assert!(h.proxy.stopped.load(Ordering::SeqCst));
        assert_eq!(h.configures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scenario_d_unsupported_routing_table() {
        let h = harness(HarnessOpts {
            routing_fails_with: Some(RoutingError::UnsupportedRoutingTable),
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);

        assert_eq!(code, ErrorCode::UnsupportedRoutingTable);
        // Both processes from this attempt are stopped during cleanup.
        assert!(h.proxy.stopped.load(Ordering::SeqCst));
        assert!(h.tunnel.stopped.load(Ordering::SeqCst));
        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_elevation_denied_maps_to_no_admin_permissions() {
        let h = harness(HarnessOpts {
            routing_fails_with: Some(RoutingError::NoAdminPermissions),
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);
        assert_eq!(code, ErrorCode::NoAdminPermissions);
    }

    #[tokio::test]
    async fn test_p2_disconnect_when_idle_is_a_noop() {
        let h = harness(HarnessOpts::default());

        h.controller.disconnect().await;

        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.resets.load(Ordering::SeqCst), 0);
        assert!(!h.proxy.stopped.load(Ordering::SeqCst));
        assert!(!h.tunnel.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_p3_second_connect_rejected_without_side_effects() {
        let h = harness(HarnessOpts {
            validator_delay: Duration::from_millis(300),
            ..HarnessOpts::default()
        });

        let controller = h.controller.clone();
        let first = tokio::spawn(async move { controller.connect(test_server_config()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = h.controller.connect(test_server_config()).await;
        assert!(matches!(second, Err(AppError::ConnectionInProgress)));
        assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 1);

        first.await.unwrap().unwrap();
        assert_eq!(h.controller.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_user_disconnect_tears_down_in_inverse_order() {
        let h = harness(HarnessOpts::default());
        h.controller.connect(test_server_config()).await.unwrap();

        h.controller.disconnect().await;

        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.resets.load(Ordering::SeqCst), 1);
        assert!(h.proxy.stopped.load(Ordering::SeqCst));
        assert!(h.tunnel.stopped.load(Ordering::SeqCst));
        assert!(!h.store.has_connection());
        // A user-initiated disconnect is not a lost connection.
        assert!(h.sink.lost.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_p5_unsolicited_tunnel_exit_forces_teardown() {
        let h = harness(HarnessOpts::default());
        let record = h.controller.connect(test_server_config()).await.unwrap();

        let exit_tx = h.tunnel.exit_tx.lock().unwrap().clone().unwrap();
        exit_tx
            .send(ProcessExit {
                kind: ProcessKind::Tunnel,
                code: Some(1),
            })
            .unwrap();

        wait_for_status(&h.controller, ConnectionStatus::Disconnected).await;

        assert_eq!(h.resets.load(Ordering::SeqCst), 1);
        assert!(h.proxy.stopped.load(Ordering::SeqCst));
        assert!(!h.store.has_connection());
        // Reported distinctly from a user-initiated disconnect.
        assert_eq!(h.sink.lost.lock().unwrap().clone(), vec![record.id]);
    }

    #[tokio::test]
    async fn test_reconnect_after_failed_attempt() {
        let h = harness(HarnessOpts {
            invalid_credentials: true,
            ..HarnessOpts::default()
        });

        let code = connect_error(h.controller.connect(test_server_config()).await);
        assert_eq!(code, ErrorCode::InvalidServerCredentials);

        // The failed attempt released its single-flight slot.
        let second = h.controller.connect(test_server_config()).await;
        assert!(matches!(
            second,
            Err(AppError::Connect(ErrorCode::InvalidServerCredentials))
        ));
    }

    #[tokio::test]
    async fn test_resolve_server_ip_passthrough() {
        let ip = resolve_server_ip("203.0.113.7", 8388).await.unwrap();
        assert_eq!(ip, "203.0.113.7");
    }
}
