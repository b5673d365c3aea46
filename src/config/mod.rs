use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::keys::{PublicKey, SecretKey};
use crate::types::Result as CniResult;

/// Network configuration passed on stdin by the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Kubeconfig used to look the tunnel config up through pod annotations
    #[serde(rename = "kubeConfigPath", default, skip_serializing_if = "Option::is_none")]
    pub kube_config_path: Option<PathBuf>,
    /// File holding a tunnel config shared by every pod on this network
    #[serde(rename = "staticConfigPath", default, skip_serializing_if = "Option::is_none")]
    pub static_config_path: Option<PathBuf>,
    /// Result of the previous plugin in the chain
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<Value>,
}

/// Where the tunnel configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// Pod annotation naming a secret, read with this kubeconfig
    Dynamic(PathBuf),
    /// Static JSON file
    Static(PathBuf),
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::Configuration(format!("failed to parse network configuration: {}", e)))?;

        conf.source()?;
        Ok(conf)
    }

    /// The single configured tunnel config source
    pub fn source(&self) -> Result<SourceRef, Error> {
        let non_empty = |p: &Option<PathBuf>| p.clone().filter(|p| !p.as_os_str().is_empty());

        match (non_empty(&self.kube_config_path), non_empty(&self.static_config_path)) {
            (Some(kube), None) => Ok(SourceRef::Dynamic(kube)),
            (None, Some(path)) => Ok(SourceRef::Static(path)),
            (None, None) => Err(Error::Configuration(
                "neither 'kubeConfigPath' nor 'staticConfigPath' given".to_string(),
            )),
            (Some(_), Some(_)) => Err(Error::Configuration(
                "only one of 'kubeConfigPath' and 'staticConfigPath' may be given".to_string(),
            )),
        }
    }

    /// The previous plugin's result, required when running as an ADD stage
    pub fn prev_result(&self) -> Result<CniResult, Error> {
        let raw = self.prev_result.clone().ok_or_else(|| {
            Error::Configuration("must be invoked as a non-terminal chain stage (no prevResult)".to_string())
        })?;

        serde_json::from_value(raw)
            .map_err(|e| Error::Configuration(format!("could not parse prevResult: {}", e)))
    }
}

/// Tunnel configuration as stored in a secret or static file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Local address in CIDR notation
    pub address: String,
    /// Base64 private key
    pub private_key: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    /// Remote endpoint as host:port
    pub endpoint: String,
    /// Base64 public key
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Keepalive interval such as "25s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<String>,
    #[serde(rename = "allowedIPs", default)]
    pub allowed_ips: Vec<String>,
}

/// Longest keepalive interval the device accepts
pub const MAX_KEEPALIVE_SECS: u64 = u16::MAX as u64;

/// A validated tunnel, ready to be applied
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub address: IpNetwork,
    pub private_key: SecretKey,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub public_key: PublicKey,
    pub preshared_key: Option<SecretKey>,
    pub endpoint: SocketAddr,
    pub persistent_keepalive: Option<Duration>,
    pub allowed_ips: Vec<IpNetwork>,
}

impl TunnelConfig {
    /// Parse a tunnel config from JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Configuration(format!("could not parse tunnel config: {}", e)))
    }

    /// Validate every field
    ///
    /// Nothing on the host is touched before this succeeds.
    pub fn validate(&self) -> Result<Tunnel, Error> {
        let address = parse_cidr(&self.address)?;
        let private_key = SecretKey::private_from_base64(&self.private_key)?;

        let peers = self
            .peers
            .iter()
            .map(PeerConfig::validate)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Tunnel {
            address,
            private_key,
            peers,
        })
    }
}

impl PeerConfig {
    fn validate(&self) -> Result<Peer, Error> {
        let public_key = PublicKey::from_base64(&self.public_key)?;

        let preshared_key = match self.preshared_key.as_deref() {
            None | Some("") => None,
            Some(encoded) => Some(SecretKey::preshared_from_base64(encoded)?),
        };

        let persistent_keepalive = match self.persistent_keepalive.as_deref() {
            None | Some("") => None,
            Some(s) => {
                let interval = parse_duration(s)?;
                if interval.as_secs() > MAX_KEEPALIVE_SECS {
                    return Err(Error::Configuration(format!(
                        "persistent keepalive {:?} exceeds {} seconds",
                        s, MAX_KEEPALIVE_SECS
                    )));
                }
                Some(interval)
            }
        };

        let endpoint = self
            .endpoint
            .to_socket_addrs()
            .map_err(|e| Error::Configuration(format!("could not resolve endpoint {:?}: {}", self.endpoint, e)))?
            .next()
            .ok_or_else(|| Error::Configuration(format!("endpoint {:?} resolved to no address", self.endpoint)))?;

        let allowed_ips = self
            .allowed_ips
            .iter()
            .map(|cidr| {
                let net = parse_cidr(cidr)?;
                IpNetwork::new(net.network(), net.prefix())
                    .map_err(|e| Error::Configuration(format!("could not parse CIDR {:?}: {}", cidr, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Peer {
            public_key,
            preshared_key,
            endpoint,
            persistent_keepalive,
            allowed_ips,
        })
    }
}

/// Parse a CIDR, requiring an explicit prefix length
pub fn parse_cidr(s: &str) -> Result<IpNetwork, Error> {
    if !s.contains('/') {
        return Err(Error::Configuration(format!("{:?} is not in CIDR notation", s)));
    }
    IpNetwork::from_str(s.trim())
        .map_err(|e| Error::Configuration(format!("could not parse CIDR {:?}: {}", s, e)))
}

/// Parse a duration such as "25s", "1m30s" or "500ms"
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let invalid = || Error::Configuration(format!("could not parse duration {:?}", s));

    let mut rest = s.trim();
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(part).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}
