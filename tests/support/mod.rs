// Shared fakes for the integration tests

#![allow(dead_code)]

use ipnetwork::IpNetwork;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use wg_cni::config::{PeerConfig, TunnelConfig};
use wg_cni::error::Error;
use wg_cni::gateway::{EgressPath, FirewallRule, HostRoute, HostRouting};
use wg_cni::link::{LinkError, LinkErrorKind, LinkOps, LinkState, Namespace};
use wg_cni::plugin::NamePool;
use wg_cni::resolver::{ClusterApi, ConfigSource};
use wg_cni::types::CmdArgs;

pub const PRIVATE_KEY: &str = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=";
pub const PEER_KEY: &str = "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=";
pub const OTHER_PEER_KEY: &str = "AwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwM=";
pub const PRESHARED_KEY: &str = "BAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQ=";
/// Valid base64, but only 16 bytes
pub const SHORT_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAA==";

pub fn peer(endpoint: &str, public_key: &str, allowed: &[&str]) -> PeerConfig {
    PeerConfig {
        endpoint: endpoint.to_string(),
        public_key: public_key.to_string(),
        preshared_key: None,
        persistent_keepalive: Some("25s".to_string()),
        allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn tunnel(address: &str, peers: Vec<PeerConfig>) -> TunnelConfig {
    TunnelConfig {
        address: address.to_string(),
        private_key: PRIVATE_KEY.to_string(),
        peers,
    }
}

/// A file standing in for a bind-mounted network namespace
pub struct Sandbox {
    _dir: TempDir,
    pub netns: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let netns = dir.path().join("netns");
        fs::write(&netns, b"").unwrap();
        Self { _dir: dir, netns }
    }

    pub fn args(&self) -> CmdArgs {
        CmdArgs {
            container_id: "test-container".to_string(),
            netns: self.netns.to_string_lossy().to_string(),
            ifname: "eth0".to_string(),
            args: HashMap::from([
                ("K8S_POD_NAMESPACE".to_string(), "default".to_string()),
                ("K8S_POD_NAME".to_string(), "web-0".to_string()),
            ]),
            path: "/opt/cni/bin".to_string(),
            stdin_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLink {
    pub up: bool,
    pub configured: bool,
    pub addresses: Vec<IpNetwork>,
    pub routes: Vec<IpNetwork>,
}

#[derive(Default)]
struct NetState {
    host: BTreeMap<String, FakeLink>,
    namespaces: BTreeMap<PathBuf, BTreeMap<String, FakeLink>>,
    calls: Vec<String>,
    failures: Vec<(String, LinkErrorKind, bool)>,
    last_config: Option<String>,
}

/// In-memory kernel
#[derive(Default)]
pub struct FakeNet {
    state: RefCell<NetState>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(self, netns: &Path) -> Self {
        self.state.borrow_mut().namespaces.insert(netns.to_path_buf(), BTreeMap::new());
        self
    }

    /// A host link that exists before the test starts
    pub fn with_host_link(self, name: &str) -> Self {
        self.state.borrow_mut().host.insert(name.to_string(), FakeLink::default());
        self
    }

    /// Make every call of `op` fail
    pub fn fail(self, op: &str, kind: LinkErrorKind) -> Self {
        self.state.borrow_mut().failures.push((op.to_string(), kind, false));
        self
    }

    /// Make the next call of `op` fail
    pub fn fail_once(self, op: &str, kind: LinkErrorKind) -> Self {
        self.state.borrow_mut().failures.push((op.to_string(), kind, true));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// Calls that change kernel state
    pub fn mutations(&self) -> Vec<String> {
        const READS: &[&str] = &["link_exists", "wireguard_links", "link_state"];
        self.calls()
            .into_iter()
            .filter(|c| !READS.iter().any(|r| c.starts_with(r)))
            .collect()
    }

    pub fn host_links(&self) -> Vec<String> {
        self.state.borrow().host.keys().cloned().collect()
    }

    pub fn links_in(&self, netns: &Path) -> BTreeMap<String, FakeLink> {
        self.state.borrow().namespaces.get(netns).cloned().unwrap_or_default()
    }

    pub fn last_config(&self) -> Option<String> {
        self.state.borrow().last_config.clone()
    }

    fn enter(&self, call: String) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        let op = call.split_whitespace().next().unwrap_or_default().to_string();
        state.calls.push(call);

        if let Some(pos) = state.failures.iter().position(|(o, _, _)| *o == op) {
            let (_, kind, once) = state.failures[pos].clone();
            if once {
                state.failures.remove(pos);
            }
            return Err(LinkError::new(op, kind, "injected failure"));
        }
        Ok(())
    }

    fn with_ns_link<T>(
        &self,
        op: &str,
        netns: &Path,
        name: &str,
        f: impl FnOnce(&mut FakeLink) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut state = self.state.borrow_mut();
        let link = state
            .namespaces
            .get_mut(netns)
            .and_then(|links| links.get_mut(name))
            .ok_or_else(|| LinkError::new(op, LinkErrorKind::NotFound, "Cannot find device"))?;
        f(link)
    }
}

impl LinkOps for FakeNet {
    fn load_module(&self, module: &str) -> Result<(), LinkError> {
        self.enter(format!("load_module {}", module))
    }

    fn link_exists(&self, ns: Namespace<'_>, name: &str) -> Result<bool, LinkError> {
        self.enter(format!("link_exists {}", name))?;
        let state = self.state.borrow();
        Ok(match ns {
            Namespace::Host => state.host.contains_key(name),
            Namespace::Path(p) => state.namespaces.get(p).map_or(false, |l| l.contains_key(name)),
        })
    }

    fn create_wireguard(&self, name: &str) -> Result<(), LinkError> {
        self.enter(format!("create_wireguard {}", name))?;
        let mut state = self.state.borrow_mut();
        if state.host.contains_key(name) {
            return Err(LinkError::new("create_wireguard", LinkErrorKind::AlreadyExists, "File exists"));
        }
        state.host.insert(name.to_string(), FakeLink::default());
        Ok(())
    }

    fn configure_wireguard(&self, name: &str, config: &str) -> Result<(), LinkError> {
        self.enter(format!("configure_wireguard {}", name))?;
        let mut state = self.state.borrow_mut();
        state.last_config = Some(config.to_string());
        let link = state
            .host
            .get_mut(name)
            .ok_or_else(|| LinkError::new("configure_wireguard", LinkErrorKind::NotFound, "No such device"))?;
        link.configured = true;
        Ok(())
    }

    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError> {
        self.enter(format!("move_to_netns {}", name))?;
        let mut state = self.state.borrow_mut();
        if !state.namespaces.contains_key(netns) {
            return Err(LinkError::new("move_to_netns", LinkErrorKind::NotFound, "Invalid netns"));
        }
        let link = state
            .host
            .remove(name)
            .ok_or_else(|| LinkError::new("move_to_netns", LinkErrorKind::NotFound, "Cannot find device"))?;
        if let Some(links) = state.namespaces.get_mut(netns) {
            links.insert(name.to_string(), link);
        }
        Ok(())
    }

    fn addr_add(&self, netns: &Path, name: &str, addr: &IpNetwork) -> Result<(), LinkError> {
        self.enter(format!("addr_add {} {}", name, addr))?;
        self.with_ns_link("addr_add", netns, name, |link| {
            if link.addresses.contains(addr) {
                return Err(LinkError::new("addr_add", LinkErrorKind::AlreadyExists, "File exists"));
            }
            link.addresses.push(*addr);
            Ok(())
        })
    }

    fn link_up(&self, netns: &Path, name: &str) -> Result<(), LinkError> {
        self.enter(format!("link_up {}", name))?;
        self.with_ns_link("link_up", netns, name, |link| {
            link.up = true;
            Ok(())
        })
    }

    fn route_add(&self, netns: &Path, name: &str, dst: &IpNetwork) -> Result<(), LinkError> {
        self.enter(format!("route_add {} {}", name, dst))?;
        self.with_ns_link("route_add", netns, name, |link| {
            if link.routes.contains(dst) {
                return Err(LinkError::new("route_add", LinkErrorKind::AlreadyExists, "File exists"));
            }
            link.routes.push(*dst);
            Ok(())
        })
    }

    fn wireguard_links(&self, ns: Namespace<'_>) -> Result<Vec<String>, LinkError> {
        self.enter("wireguard_links".to_string())?;
        let state = self.state.borrow();
        match ns {
            Namespace::Host => Ok(state.host.keys().cloned().collect()),
            Namespace::Path(p) => state
                .namespaces
                .get(p)
                .map(|links| links.keys().cloned().collect())
                .ok_or_else(|| LinkError::new("wireguard_links", LinkErrorKind::NotFound, "No such file or directory")),
        }
    }

    fn link_state(&self, netns: &Path, name: &str) -> Result<LinkState, LinkError> {
        self.enter(format!("link_state {}", name))?;
        self.with_ns_link("link_state", netns, name, |link| {
            Ok(LinkState {
                up: link.up,
                addresses: link.addresses.clone(),
            })
        })
    }

    fn link_delete(&self, ns: Namespace<'_>, name: &str) -> Result<(), LinkError> {
        self.enter(format!("link_delete {}", name))?;
        let mut state = self.state.borrow_mut();
        let removed = match ns {
            Namespace::Host => state.host.remove(name),
            Namespace::Path(p) => state.namespaces.get_mut(p).and_then(|l| l.remove(name)),
        };
        removed
            .map(|_| ())
            .ok_or_else(|| LinkError::new("link_delete", LinkErrorKind::NotFound, "Cannot find device"))
    }
}

/// Hands out a fixed sequence of names
pub struct FixedNames(pub VecDeque<String>);

impl FixedNames {
    pub fn new(names: &[&str]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

impl NamePool for FixedNames {
    fn next_name(&mut self) -> Result<String, Error> {
        self.0
            .pop_front()
            .ok_or_else(|| Error::Resource("name pool exhausted".to_string()))
    }
}

/// Returns a fixed tunnel config, or none for a workload that has not opted in
pub struct FixedSource(pub Option<TunnelConfig>);

impl ConfigSource for FixedSource {
    fn load(&self, _args: &CmdArgs) -> Result<Option<TunnelConfig>, Error> {
        Ok(self.0.clone())
    }
}

/// Cluster with one pod and its secrets
#[derive(Default)]
pub struct FakeCluster {
    pub annotations: HashMap<String, String>,
    pub secrets: HashMap<String, Vec<u8>>,
    pub lookups: RefCell<Vec<String>>,
}

impl ClusterApi for FakeCluster {
    fn pod_annotations(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>, Error> {
        self.lookups.borrow_mut().push(format!("pod {}/{}", namespace, name));
        Ok(self.annotations.clone())
    }

    fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, Error> {
        self.lookups.borrow_mut().push(format!("secret {}/{}", namespace, name));
        self.secrets
            .get(&format!("{}/{}", name, key))
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("secret {} not found", name)))
    }
}

/// In-memory gateway host
#[derive(Default)]
pub struct FakeHost {
    pub interfaces: Vec<String>,
    pub endpoints: Vec<SocketAddr>,
    pub egress: Option<EgressPath>,
    pub routes: RefCell<Vec<HostRoute>>,
    pub rules: RefCell<Vec<FirewallRule>>,
    pub appended: RefCell<Vec<FirewallRule>>,
    pub forwarding: RefCell<bool>,
    pub mutations: RefCell<Vec<String>>,
}

impl FakeHost {
    pub fn with_tunnel(iface: &str, endpoint: &str) -> Self {
        Self {
            interfaces: vec![iface.to_string()],
            endpoints: vec![endpoint.parse().unwrap()],
            egress: Some(EgressPath {
                dev: "ens3".to_string(),
                gateway: Some("192.0.2.1".parse().unwrap()),
            }),
            ..Self::default()
        }
    }
}

impl HostRouting for FakeHost {
    fn wireguard_interfaces(&self) -> Result<Vec<String>, LinkError> {
        Ok(self.interfaces.clone())
    }

    fn peer_endpoints(&self, _iface: &str) -> Result<Vec<SocketAddr>, LinkError> {
        Ok(self.endpoints.clone())
    }

    fn route_lookup(&self, dst: IpAddr) -> Result<EgressPath, LinkError> {
        self.egress
            .clone()
            .ok_or_else(|| LinkError::new("route_lookup", LinkErrorKind::NotFound, format!("no route to {}", dst)))
    }

    fn route_add(&self, route: &HostRoute) -> Result<(), LinkError> {
        self.mutations.borrow_mut().push(format!("route {}", route));
        let mut routes = self.routes.borrow_mut();
        if routes.contains(route) {
            return Err(LinkError::new("route_add", LinkErrorKind::AlreadyExists, "File exists"));
        }
        routes.push(route.clone());
        Ok(())
    }

    fn enable_forwarding(&self) -> Result<(), LinkError> {
        self.mutations.borrow_mut().push("forwarding".to_string());
        *self.forwarding.borrow_mut() = true;
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, LinkError> {
        Ok(self.rules.borrow().contains(rule))
    }

    fn rule_append(&self, rule: &FirewallRule) -> Result<(), LinkError> {
        self.mutations.borrow_mut().push(format!("rule {} {}", rule.table, rule.chain));
        self.rules.borrow_mut().push(rule.clone());
        self.appended.borrow_mut().push(rule.clone());
        Ok(())
    }
}

pub fn cidr(s: &str) -> IpNetwork {
    s.parse().unwrap()
}
