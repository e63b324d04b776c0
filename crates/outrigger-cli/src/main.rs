//! Outrigger CLI
//!
//! Command-line interface for the Outrigger tunnel client. Connects the
//! machine through a remote Shadowsocks server and keeps the tunnel up
//! until interrupted, tearing everything down on exit.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use outrigger_core::{
    Components, ConnectionController, ConnectionStore, JsonFileStore, PlatformElevator,
    RoutingServiceClient, ServerConfig, ShadowsocksProxyLauncher, SocksCredentialValidator,
    StdoutEventSink, TcpReachabilityProbe, Tun2socksLauncher, TunDeviceConfig, TunnelConfig,
};

/// Outrigger - route this machine's traffic through a Shadowsocks tunnel
#[derive(Parser, Debug)]
#[command(name = "outrigger")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a server and hold the tunnel until Ctrl-C
    Connect(ConnectArgs),
    /// Re-establish the last stored connection
    Reconnect,
    /// Show the stored connection, if any
    Status,
    /// Forget the stored connection
    Forget,
}

#[derive(clap::Args, Debug)]
struct ConnectArgs {
    /// Server hostname or IP address
    #[arg(long)]
    host: String,

    /// Server port
    #[arg(long)]
    port: u16,

    /// Server password
    #[arg(long, env = "OUTRIGGER_PASSWORD")]
    password: String,

    /// Shadowsocks cipher name
    #[arg(long, default_value = "chacha20-ietf-poly1305")]
    method: String,

    /// Display name for this server
    #[arg(long)]
    name: Option<String>,

    /// Path to the Shadowsocks client binary
    #[arg(long, default_value = "ss-local")]
    proxy_bin: PathBuf,

    /// Path to the tun2socks binary
    #[arg(long, default_value = "tun2socks")]
    tunnel_bin: PathBuf,
}

impl ConnectArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            method: self.method.clone(),
            name: self.name.clone(),
        }
    }

    fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            proxy_binary: self.proxy_bin.clone(),
            tunnel_binary: self.tunnel_bin.clone(),
            ..TunnelConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let json_output = matches!(args.format, OutputFormat::Json);

    match args.command {
        Command::Connect(connect) => {
            run_tunnel(connect.server_config(), connect.tunnel_config(), json_output).await
        }
        Command::Reconnect => {
            let store = JsonFileStore::at_default_path();
            match store.load().await {
                Ok(record) => {
                    tracing::info!("re-establishing {}", record.config.display_name());
                    run_tunnel(record.config, TunnelConfig::default(), json_output).await
                }
                Err(_) => {
                    eprintln!("No stored connection to re-establish");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Status => show_status(json_output).await,
        Command::Forget => {
            let store = JsonFileStore::at_default_path();
            match store.clear().await {
                Ok(()) => {
                    println!("Stored connection cleared");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Wire the real pipeline components together and hold the tunnel open
async fn run_tunnel(server: ServerConfig, tunnel: TunnelConfig, json_output: bool) -> ExitCode {
    let device = TunDeviceConfig::default();
    let router_ip = device.router_ip.clone();

    let components = Components {
        probe: Arc::new(TcpReachabilityProbe),
        proxy_launcher: Arc::new(ShadowsocksProxyLauncher::new(
            tunnel.proxy_binary.clone(),
            tunnel.local_proxy_port,
        )),
        validator: Arc::new(SocksCredentialValidator::new(tunnel.credential_timeout)),
        tunnel_launcher: Arc::new(Tun2socksLauncher::new(tunnel.tunnel_binary.clone(), device)),
        routing: Box::new(RoutingServiceClient::new(Box::new(
            PlatformElevator::default(),
        ))),
        store: Arc::new(JsonFileStore::at_default_path()),
        events: Arc::new(StdoutEventSink::new(json_output)),
    };
    let controller = ConnectionController::new(tunnel, router_ip, components);

    match controller.connect(server).await {
        Ok(record) => tracing::info!("tunnel up (record {})", record.id),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("could not listen for Ctrl-C; disconnecting");
    }
    controller.disconnect().await;
    ExitCode::SUCCESS
}

async fn show_status(json_output: bool) -> ExitCode {
    let store = JsonFileStore::at_default_path();
    if !store.has_connection() {
        println!("No stored connection");
        return ExitCode::SUCCESS;
    }
    match store.load().await {
        Ok(record) => {
            if json_output {
                println!("{}", serde_json::to_string(&record).unwrap_or_default());
            } else {
                println!(
                    "Last connection: {} (connected {})",
                    record.config.display_name(),
                    record.connected_at
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
