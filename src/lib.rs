//! WireGuard CNI plugin for Kubernetes
//!
//! This implementation provides a pure Rust chained CNI plugin that:
//! - Creates a WireGuard interface on the host and configures its keys and peers
//! - Moves it into the container network namespace
//! - Configures its address and the routes for each peer's allowed ranges
//! - Handles cleanup on container deletion
//!
//! It also carries the controller behind `wg-gateway`, which routes a
//! gateway host's egress through its WireGuard tunnel.

pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod link;
pub mod plugin;
pub mod resolver;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni, Failure};
pub use config::{NetConf, Tunnel, TunnelConfig};
pub use error::Error;
pub use gateway::GatewayController;
pub use plugin::WireguardPlugin;
