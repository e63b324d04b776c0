//! Outrigger Core Library
//!
//! The desktop orchestration core of a Shadowsocks tunnel client: it
//! supervises the two helper processes (a local SOCKS5 proxy and a
//! SOCKS-to-TUN bridge), verifies end-to-end reachability and credential
//! validity before committing to any system-wide change, and drives the
//! privileged routing service over local IPC. This crate is independent of
//! any GUI framework; frontends plug in through [`events::EventSink`].
//!
//! # Modules
//!
//! - [`connection`] - Connection lifecycle state machine
//! - [`process`] - Child process supervision and launchers
//! - [`routing`] - Privileged routing-service IPC client
//! - [`credentials`] - HTTP-over-SOCKS credential probe
//! - [`reachability`] - TCP reachability probe
//! - [`store`] - Last-connection persistence
//! - [`config`] - Server and pipeline configuration
//! - [`events`] - Event sink trait for decoupling from GUI frameworks
//! - [`error`] - Error types

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod process;
pub mod reachability;
pub mod routing;
pub mod store;

// Re-export commonly used types
pub use config::{ServerConfig, TunnelConfig};
pub use connection::{Components, ConnectionController, ConnectionStatus};
pub use credentials::{CredentialCheck, SocksCredentialValidator};
pub use error::{AppError, ErrorCode, Result};
pub use events::{EventSink, NoOpEventSink, StdoutEventSink};
pub use process::{
    ProcessExit, ProcessHandle, ProcessKind, ProxyLauncher, ShadowsocksProxyLauncher,
    Tun2socksLauncher, TunDeviceConfig, TunnelLauncher,
};
pub use reachability::{ReachabilityProbe, TcpReachabilityProbe};
pub use routing::{
    ElevationOutcome, PlatformElevator, RoutingError, RoutingService, RoutingServiceClient,
    ServiceElevator,
};
pub use store::{ConnectionRecord, ConnectionStore, JsonFileStore};
