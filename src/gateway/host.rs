use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};

use super::{EgressPath, FirewallRule, HostRoute, HostRouting};
use crate::link::{exec, LinkError, LinkErrorKind};

#[derive(Debug, Deserialize)]
struct RouteGet {
    dev: String,
    #[serde(default)]
    gateway: Option<IpAddr>,
}

/// `HostRouting` backed by wireguard-tools, iproute2, iptables and sysctl
#[derive(Debug, Default, Clone)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }
}

fn parse_endpoints(output: &str) -> Vec<SocketAddr> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|endpoint| endpoint.parse().ok())
        .collect()
}

impl HostRouting for SystemHost {
    fn wireguard_interfaces(&self) -> Result<Vec<String>, LinkError> {
        let out = exec("wg", &["show", "interfaces"], None)?;
        Ok(String::from_utf8_lossy(&out)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    fn peer_endpoints(&self, iface: &str) -> Result<Vec<SocketAddr>, LinkError> {
        let out = exec("wg", &["show", iface, "endpoints"], None)?;
        Ok(parse_endpoints(&String::from_utf8_lossy(&out)))
    }

    fn route_lookup(&self, dst: IpAddr) -> Result<EgressPath, LinkError> {
        let dst = dst.to_string();
        let out = exec("ip", &["-j", "route", "get", &dst], None)?;
        let routes: Vec<RouteGet> = serde_json::from_slice(&out)
            .map_err(|e| LinkError::new("ip -j route get", LinkErrorKind::Other, e.to_string()))?;

        routes
            .into_iter()
            .next()
            .map(|r| EgressPath {
                dev: r.dev,
                gateway: r.gateway,
            })
            .ok_or_else(|| LinkError::new("ip -j route get", LinkErrorKind::NotFound, format!("no route to {}", dst)))
    }

    fn route_add(&self, route: &HostRoute) -> Result<(), LinkError> {
        let dst = route.dst.to_string();
        let via = route.via.map(|v| v.to_string());

        let mut args = vec!["route", "add", dst.as_str()];
        if let Some(via) = via.as_deref() {
            args.extend(["via", via]);
        }
        args.extend(["dev", route.dev.as_str()]);

        exec("ip", &args, None).map(|_| ())
    }

    fn enable_forwarding(&self) -> Result<(), LinkError> {
        exec("sysctl", &["-w", "net.ipv4.ip_forward=1"], None).map(|_| ())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, LinkError> {
        let mut args = vec!["-t", rule.table, "-C", rule.chain];
        args.extend(rule.args.iter().map(String::as_str));

        match exec("iptables", &args, None) {
            Ok(_) => Ok(true),
            Err(e) if e.message.contains("does a matching rule exist") => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn rule_append(&self, rule: &FirewallRule) -> Result<(), LinkError> {
        let mut args = vec!["-t", rule.table, "-A", rule.chain];
        args.extend(rule.args.iter().map(String::as_str));

        exec("iptables", &args, None).map(|_| ())
    }
}
