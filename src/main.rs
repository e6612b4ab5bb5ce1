//! ferrotun CLI
//!
//! Loads a tunnel configuration, attaches a TUN interface, brings the
//! device up, and serves the control socket until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use ferrotun::error::{ConfigError, NetworkError, TunnelError};
use ferrotun::{Device, DeviceConfig, FerrotunError, Tun, TunnelConfig};

/// Userspace WireGuard tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "ferrotun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the tunnel configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Interface name (used for the control socket path)
    #[arg(short, long, default_value = "ftun0")]
    interface: String,

    /// Control socket path (default: /var/run/ferrotun/<interface>.sock)
    #[arg(long)]
    control_socket: Option<PathBuf>,
}

fn init_logging() {
    // LOG_LEVEL ∈ {silent, error, verbose}; RUST_LOG wins when present.
    let filter = match std::env::var("LOG_LEVEL").as_deref() {
        Ok("silent") => EnvFilter::new("off"),
        Ok("error") => EnvFilter::new("error"),
        Ok("verbose") => EnvFilter::new("debug"),
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", user_message(&e));
            exit_code(&e)
        }
    }
}

async fn run(args: Args) -> Result<(), FerrotunError> {
    tracing::info!("loading configuration from {}", args.config.display());
    let config = TunnelConfig::from_file(&args.config)?;

    let address = config
        .interface
        .address
        .first()
        .ok_or_else(|| ConfigError::MissingField {
            field: "Address".to_string(),
        })?;
    let mtu = config.interface.mtu.unwrap_or(ferrotun::tun::DEFAULT_MTU);

    let tun = Tun::native(address.addr(), address.prefix_len(), mtu)?;
    let device = Arc::new(Device::new(tun, DeviceConfig::default()));

    config.apply(&device).await?;
    device.up().await?;
    tracing::info!(
        "tunnel up: {} peer(s), port {}",
        device.peer_count(),
        device.listen_port()
    );

    let socket_path = args
        .control_socket
        .unwrap_or_else(|| PathBuf::from(format!("/var/run/ferrotun/{}.sock", args.interface)));
    let control_device = device.clone();
    let control = tokio::spawn(async move {
        if let Err(e) = ferrotun::uapi::serve(control_device, &socket_path).await {
            tracing::error!("control socket failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await.map_err(FerrotunError::System)?;
    tracing::info!("shutting down");
    control.abort();
    device.close();
    Ok(())
}

fn user_message(error: &FerrotunError) -> String {
    match error {
        FerrotunError::Tunnel(TunnelError::InsufficientPrivileges { .. })
        | FerrotunError::Tunnel(TunnelError::CreateFailed { .. }) => {
            format!(
                "{}\n  run as root or grant CAP_NET_ADMIN:\n  sudo setcap cap_net_admin=eip ferrotun",
                error
            )
        }
        FerrotunError::Config(ConfigError::FileNotFound { path }) => {
            format!("configuration file not found: {}", path)
        }
        FerrotunError::Network(NetworkError::BindFailed { addr, .. }) => {
            format!("{}\n  is another tunnel already listening on {}?", error, addr)
        }
        _ => format!("{}", error),
    }
}

fn exit_code(error: &FerrotunError) -> ExitCode {
    match error {
        FerrotunError::Config(_) => ExitCode::from(1),
        FerrotunError::Tunnel(_) => ExitCode::from(2),
        FerrotunError::Network(_) => ExitCode::from(3),
        FerrotunError::Protocol(_) => ExitCode::from(4),
        FerrotunError::Crypto(_) => ExitCode::from(5),
        _ => ExitCode::from(255),
    }
}
