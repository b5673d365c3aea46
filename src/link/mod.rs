//! Kernel link, address and route mutations
//!
//! `LinkOps` is the seam between the plugin's sequencing logic and the host.
//! `IpCommand` implements it by driving `ip`, `wg` and `modprobe`, entering
//! the target network namespace with `setns(2)` for namespace-scoped calls.

use ipnetwork::IpNetwork;
use itertools::Itertools;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// How a failed mutation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// The object being added is already there
    AlreadyExists,
    /// The object, its link or its namespace is gone
    NotFound,
    Other,
}

/// A failed link, address or route operation
#[derive(Debug, Clone, Error)]
#[error("{op} failed: {message}")]
pub struct LinkError {
    pub op: String,
    pub kind: LinkErrorKind,
    pub message: String,
}

impl LinkError {
    pub fn new(op: impl Into<String>, kind: LinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == LinkErrorKind::AlreadyExists
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == LinkErrorKind::NotFound
    }
}

/// Namespace an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace<'a> {
    /// The namespace this process runs in
    Host,
    /// A namespace bind-mounted at a path, e.g. CNI_NETNS
    Path(&'a Path),
}

/// State of a link as seen from inside its namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
}

/// Link operations needed to attach and detach a WireGuard interface
pub trait LinkOps {
    /// Load a kernel module, idempotent
    fn load_module(&self, module: &str) -> Result<(), LinkError>;

    fn link_exists(&self, ns: Namespace<'_>, name: &str) -> Result<bool, LinkError>;

    /// Create a WireGuard link in the host namespace
    fn create_wireguard(&self, name: &str) -> Result<(), LinkError>;

    /// Apply a `wg setconf` document to a host-side link
    fn configure_wireguard(&self, name: &str, config: &str) -> Result<(), LinkError>;

    /// Move a host-side link into the namespace at `netns`
    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError>;

    fn addr_add(&self, netns: &Path, name: &str, addr: &IpNetwork) -> Result<(), LinkError>;

    fn link_up(&self, netns: &Path, name: &str) -> Result<(), LinkError>;

    /// Add a link-scoped route to `dst` through `name`
    fn route_add(&self, netns: &Path, name: &str, dst: &IpNetwork) -> Result<(), LinkError>;

    /// Names of every WireGuard link in a namespace
    fn wireguard_links(&self, ns: Namespace<'_>) -> Result<Vec<String>, LinkError>;

    fn link_state(&self, netns: &Path, name: &str) -> Result<LinkState, LinkError>;

    fn link_delete(&self, ns: Namespace<'_>, name: &str) -> Result<(), LinkError>;
}

/// Classify a tool's stderr into a failure kind
pub fn classify(stderr: &str) -> LinkErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("file exists") || lower.contains("already exists") || lower.contains("already assigned") {
        LinkErrorKind::AlreadyExists
    } else if lower.contains("cannot find device")
        || lower.contains("does not exist")
        || lower.contains("no such device")
        || lower.contains("no such process")
        || lower.contains("no such file or directory")
        || lower.contains("cannot assign requested address")
    {
        LinkErrorKind::NotFound
    } else {
        LinkErrorKind::Other
    }
}

/// Run a command, returning its stdout on success
pub fn exec(program: &str, args: &[&str], stdin: Option<&str>) -> Result<Vec<u8>, LinkError> {
    let op = format!("{} {}", program, args.iter().take(3).join(" "));
    debug!("exec: {} {}", program, args.iter().join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| LinkError::new(op.clone(), LinkErrorKind::Other, format!("failed to execute: {}", e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .map_err(|e| LinkError::new(op.clone(), LinkErrorKind::Other, format!("failed to write stdin: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| LinkError::new(op.clone(), LinkErrorKind::Other, format!("failed to wait: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(LinkError::new(op, classify(&stderr), stderr));
    }

    Ok(output.stdout)
}

/// Execute a function inside a network namespace
///
/// `setns` only affects the calling thread; commands spawned from it inherit
/// the namespace. The original namespace is restored before returning.
pub fn in_netns<T, F>(netns_path: &Path, f: F) -> Result<T, LinkError>
where
    F: FnOnce() -> Result<T, LinkError>,
{
    let op = format!("setns {}", netns_path.display());
    let sys = |kind: LinkErrorKind, e: nix::Error| LinkError::new(op.clone(), kind, e.to_string());

    let orig_fd = open("/proc/thread-self/ns/net", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| sys(LinkErrorKind::Other, e))?;

    let netns_fd = match open(netns_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(orig_fd);
            let kind = if e == nix::Error::ENOENT {
                LinkErrorKind::NotFound
            } else {
                LinkErrorKind::Other
            };
            return Err(sys(kind, e));
        }
    };

    if let Err(e) = setns(netns_fd, CloneFlags::CLONE_NEWNET) {
        let _ = close(netns_fd);
        let _ = close(orig_fd);
        return Err(sys(LinkErrorKind::Other, e));
    }
    let _ = close(netns_fd);

    let result = f();

    let restored = setns(orig_fd, CloneFlags::CLONE_NEWNET);
    let _ = close(orig_fd);
    restored.map_err(|e| sys(LinkErrorKind::Other, e))?;

    result
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: String,
    prefixlen: u8,
}

/// `LinkOps` backed by iproute2 and wireguard-tools
#[derive(Debug, Default, Clone)]
pub struct IpCommand;

impl IpCommand {
    pub fn new() -> Self {
        Self
    }

    fn in_ns<T, F>(&self, ns: Namespace<'_>, f: F) -> Result<T, LinkError>
    where
        F: FnOnce() -> Result<T, LinkError>,
    {
        match ns {
            Namespace::Host => f(),
            Namespace::Path(path) => in_netns(path, f),
        }
    }
}

impl LinkOps for IpCommand {
    fn load_module(&self, module: &str) -> Result<(), LinkError> {
        exec("modprobe", &[module], None).map(|_| ())
    }

    fn link_exists(&self, ns: Namespace<'_>, name: &str) -> Result<bool, LinkError> {
        self.in_ns(ns, || match exec("ip", &["link", "show", "dev", name], None) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        })
    }

    fn create_wireguard(&self, name: &str) -> Result<(), LinkError> {
        exec("ip", &["link", "add", "dev", name, "type", "wireguard"], None).map(|_| ())
    }

    fn configure_wireguard(&self, name: &str, config: &str) -> Result<(), LinkError> {
        exec("wg", &["setconf", name, "/dev/stdin"], Some(config)).map(|_| ())
    }

    fn move_to_netns(&self, name: &str, netns: &Path) -> Result<(), LinkError> {
        let netns = netns.to_string_lossy();
        exec("ip", &["link", "set", "dev", name, "netns", netns.as_ref()], None).map(|_| ())
    }

    fn addr_add(&self, netns: &Path, name: &str, addr: &IpNetwork) -> Result<(), LinkError> {
        let addr = addr.to_string();
        in_netns(netns, || exec("ip", &["addr", "add", &addr, "dev", name], None).map(|_| ()))
    }

    fn link_up(&self, netns: &Path, name: &str) -> Result<(), LinkError> {
        in_netns(netns, || exec("ip", &["link", "set", "dev", name, "up"], None).map(|_| ()))
    }

    fn route_add(&self, netns: &Path, name: &str, dst: &IpNetwork) -> Result<(), LinkError> {
        let dst = dst.to_string();
        in_netns(netns, || {
            exec("ip", &["route", "add", &dst, "dev", name, "scope", "link"], None).map(|_| ())
        })
    }

    fn wireguard_links(&self, ns: Namespace<'_>) -> Result<Vec<String>, LinkError> {
        self.in_ns(ns, || {
            let out = exec("ip", &["-j", "link", "show", "type", "wireguard"], None)?;
            let links: Vec<IpLink> = serde_json::from_slice(&out)
                .map_err(|e| LinkError::new("ip -j link show", LinkErrorKind::Other, e.to_string()))?;
            Ok(links.into_iter().map(|l| l.ifname).collect())
        })
    }

    fn link_state(&self, netns: &Path, name: &str) -> Result<LinkState, LinkError> {
        in_netns(netns, || {
            let out = exec("ip", &["-j", "addr", "show", "dev", name], None)?;
            let links: Vec<IpLink> = serde_json::from_slice(&out)
                .map_err(|e| LinkError::new("ip -j addr show", LinkErrorKind::Other, e.to_string()))?;
            let link = links
                .into_iter()
                .next()
                .ok_or_else(|| LinkError::new("ip -j addr show", LinkErrorKind::NotFound, name.to_string()))?;

            let addresses = link
                .addr_info
                .iter()
                .filter_map(|a| IpNetwork::new(a.local.parse().ok()?, a.prefixlen).ok())
                .collect();

            Ok(LinkState {
                up: link.flags.iter().any(|f| f == "UP"),
                addresses,
            })
        })
    }

    fn link_delete(&self, ns: Namespace<'_>, name: &str) -> Result<(), LinkError> {
        self.in_ns(ns, || exec("ip", &["link", "delete", "dev", name], None).map(|_| ()))
    }
}
