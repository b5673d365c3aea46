//! Gateway Routing Controller
//!
//! Runs once on a dedicated gateway host: find the single WireGuard tunnel,
//! send all egress through it without touching the existing default route,
//! and NAT forwarded traffic onto it. Nothing is undone on exit.

mod host;

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

use crate::config::parse_cidr;
use crate::error::Error;
use crate::link::LinkError;

pub use host::SystemHost;

/// Route installed on the gateway host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoute {
    pub dst: IpNetwork,
    pub dev: String,
    pub via: Option<IpAddr>,
}

impl fmt::Display for HostRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(via) = self.via {
            write!(f, " via {}", via)?;
        }
        write!(f, " dev {}", self.dev)
    }
}

/// The path traffic to a destination takes before the controller changes anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressPath {
    pub dev: String,
    pub gateway: Option<IpAddr>,
}

/// An iptables rule, as the arguments following the chain name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl FirewallRule {
    /// Accept return traffic for connections forwarded from `ingress` into `tunnel`
    pub fn forward_established(ingress: &str, tunnel: &str) -> Self {
        Self {
            table: "filter",
            chain: "FORWARD",
            args: ["-i", ingress, "-o", tunnel, "-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Rewrite the source address of everything leaving through `tunnel`
    pub fn masquerade(tunnel: &str) -> Self {
        Self {
            table: "nat",
            chain: "POSTROUTING",
            args: ["-o", tunnel, "-j", "MASQUERADE"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Host operations the controller needs
pub trait HostRouting {
    /// Names of every WireGuard interface on the host
    fn wireguard_interfaces(&self) -> Result<Vec<String>, LinkError>;

    /// Current endpoints of the interface's peers, peers without one omitted
    fn peer_endpoints(&self, iface: &str) -> Result<Vec<SocketAddr>, LinkError>;

    /// How the kernel currently routes to `dst`
    fn route_lookup(&self, dst: IpAddr) -> Result<EgressPath, LinkError>;

    fn route_add(&self, route: &HostRoute) -> Result<(), LinkError>;

    fn enable_forwarding(&self) -> Result<(), LinkError>;

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, LinkError>;

    fn rule_append(&self, rule: &FirewallRule) -> Result<(), LinkError>;
}

/// Controller stage, only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Discover,
    Route,
    Nat,
    Steady,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayState::Discover => "DISCOVER",
            GatewayState::Route => "ROUTE",
            GatewayState::Nat => "NAT",
            GatewayState::Steady => "STEADY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Interface whose traffic is forwarded into the tunnel
    pub ingress_interface: String,
    /// Pin the endpoint-exclusion route to this interface instead of the
    /// one the kernel currently picks
    pub egress_interface: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ingress_interface: "eth0".to_string(),
            egress_interface: None,
        }
    }
}

/// What discovery found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTunnel {
    pub iface: String,
    pub endpoint: IpAddr,
    pub egress: EgressPath,
}

/// Half-ranges that together cover the IPv4 space
///
/// More specific than the default route, so they win without replacing it.
pub const SPLIT_DEFAULT_RANGES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

pub struct GatewayController<H> {
    host: H,
    settings: GatewaySettings,
    state: GatewayState,
}

impl<H: HostRouting> GatewayController<H> {
    pub fn new(host: H, settings: GatewaySettings) -> Self {
        Self {
            host,
            settings,
            state: GatewayState::Discover,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Drive DISCOVER, ROUTE and NAT, leaving the controller in STEADY
    ///
    /// Any failure is terminal; the caller exits rather than retrying.
    pub fn run(&mut self) -> Result<ActiveTunnel, Error> {
        if self.state != GatewayState::Discover {
            return Err(Error::Configuration(format!(
                "controller already ran (state {})",
                self.state
            )));
        }

        let tunnel = self.discover()?;
        self.advance(GatewayState::Route);

        self.install_routes(&tunnel)?;
        self.advance(GatewayState::Nat);

        self.install_nat(&tunnel)?;
        self.advance(GatewayState::Steady);

        Ok(tunnel)
    }

    fn advance(&mut self, next: GatewayState) {
        info!("Gateway {} -> {}", self.state, next);
        self.state = next;
    }

    fn discover(&self) -> Result<ActiveTunnel, Error> {
        let interfaces = self
            .host
            .wireguard_interfaces()
            .map_err(|e| Error::Discovery(format!("could not list WireGuard interfaces: {}", e)))?;

        let iface = match interfaces.as_slice() {
            [iface] => iface.clone(),
            [] => return Err(Error::Discovery("no WireGuard interface found".to_string())),
            _ => {
                return Err(Error::Discovery(format!(
                    "expected one WireGuard interface, found {}: {}",
                    interfaces.len(),
                    interfaces.join(", ")
                )))
            }
        };

        let endpoints = self
            .host
            .peer_endpoints(&iface)
            .map_err(|e| Error::Discovery(format!("could not read endpoints of {}: {}", iface, e)))?;

        let endpoint = endpoints
            .first()
            .map(SocketAddr::ip)
            .ok_or_else(|| Error::Discovery(format!("no peer of {} has an endpoint", iface)))?;
        if endpoints.len() > 1 {
            warn!("{} has {} peer endpoints, exempting only {}", iface, endpoints.len(), endpoint);
        }

        let mut egress = self
            .host
            .route_lookup(endpoint)
            .map_err(|e| Error::Discovery(format!("could not find the route to {}: {}", endpoint, e)))?;

        if egress.dev == iface {
            return Err(Error::Discovery(format!(
                "endpoint {} is already routed through {}",
                endpoint, iface
            )));
        }

        if let Some(pinned) = &self.settings.egress_interface {
            if *pinned != egress.dev {
                debug!("Egress to {} pinned to {} instead of {}", endpoint, pinned, egress.dev);
                egress = EgressPath {
                    dev: pinned.clone(),
                    gateway: None,
                };
            }
        }

        info!("Found tunnel {} with endpoint {} (egress {})", iface, endpoint, egress.dev);
        Ok(ActiveTunnel { iface, endpoint, egress })
    }

    fn install_routes(&self, tunnel: &ActiveTunnel) -> Result<(), Error> {
        // The exemption goes in first so the endpoint is never routed into
        // its own tunnel, not even between two route additions.
        let exclusion = HostRoute {
            dst: IpNetwork::from(tunnel.endpoint),
            dev: tunnel.egress.dev.clone(),
            via: tunnel.egress.gateway,
        };
        self.add_route(&exclusion)?;

        for range in SPLIT_DEFAULT_RANGES {
            self.add_route(&HostRoute {
                dst: parse_cidr(range)?,
                dev: tunnel.iface.clone(),
                via: None,
            })?;
        }

        Ok(())
    }

    fn add_route(&self, route: &HostRoute) -> Result<(), Error> {
        match self.host.route_add(route) {
            Ok(()) => info!("Added route {}", route),
            Err(e) if e.is_already_exists() => debug!("Route {} already present", route),
            Err(e) => return Err(Error::network(&format!("could not add route {}", route), e)),
        }
        Ok(())
    }

    fn install_nat(&self, tunnel: &ActiveTunnel) -> Result<(), Error> {
        self.host
            .enable_forwarding()
            .map_err(|e| Error::network("could not enable IPv4 forwarding", e))?;

        let rules = [
            FirewallRule::forward_established(&self.settings.ingress_interface, &tunnel.iface),
            FirewallRule::masquerade(&tunnel.iface),
        ];

        for rule in &rules {
            let present = self
                .host
                .rule_exists(rule)
                .map_err(|e| Error::network("could not check firewall rule", e))?;
            if present {
                debug!("Rule {} {} {:?} already present", rule.table, rule.chain, rule.args);
                continue;
            }

            self.host
                .rule_append(rule)
                .map_err(|e| Error::network(&format!("could not append rule to {} {}", rule.table, rule.chain), e))?;
            info!("Appended rule {} {} {}", rule.table, rule.chain, rule.args.join(" "));
        }

        Ok(())
    }
}
