use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wg_cni::gateway::{GatewayController, GatewaySettings, SystemHost};

/// Route a gateway host's egress through its WireGuard tunnel
#[derive(Parser)]
#[clap(name = "wg-gateway", author, version, about)]
struct Cli {
    /// Interface whose forwarded traffic is sent into the tunnel
    #[clap(long, default_value = "eth0")]
    ingress_interface: String,

    /// Interface that keeps carrying traffic to the tunnel endpoint
    /// (defaults to the one currently routing to it)
    #[clap(long)]
    egress_interface: Option<String>,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,
}

/// Block until SIGINT or SIGTERM
async fn wait_for_termination() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for SIGINT")?,
        _ = term.recv() => {},
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let default_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let settings = GatewaySettings {
        ingress_interface: cli.ingress_interface,
        egress_interface: cli.egress_interface,
    };

    let mut controller = GatewayController::new(SystemHost::new(), settings);
    let tunnel = match controller.run() {
        Ok(tunnel) => tunnel,
        Err(err) => {
            error!("Gateway setup failed in {}: {}", controller.state(), err);
            std::process::exit(1);
        }
    };

    info!(
        "Routing egress through {} (endpoint {} via {}), state {}",
        tunnel.iface,
        tunnel.endpoint,
        tunnel.egress.dev,
        controller.state()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    runtime.block_on(wait_for_termination())?;

    info!("Terminating, routes and NAT rules are left in place");
    Ok(())
}
