//! Interface Provisioner
//!
//! Creates the WireGuard link in the host namespace and binds its identity
//! and peers before it is moved anywhere.

use ring::rand::{SecureRandom, SystemRandom};
use std::fmt::Write as _;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::Tunnel;
use crate::error::Error;
use crate::link::{LinkOps, Namespace};

/// Attempts at finding a free interface name before giving up
pub const MAX_NAME_ATTEMPTS: usize = 8;

pub const NAME_PREFIX: &str = "wg";

/// Random characters after the prefix, 36^6 possible names
pub const NAME_SUFFIX_LEN: usize = 6;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Largest byte value that maps onto ALPHABET without bias
const UNBIASED_LIMIT: u8 = (256 - 256 % ALPHABET.len()) as u8;

/// Source of candidate interface names
pub trait NamePool {
    fn next_name(&mut self) -> Result<String, Error>;
}

/// Names drawn from the system CSPRNG
pub struct RandomNames {
    rng: SystemRandom,
}

impl RandomNames {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for RandomNames {
    fn default() -> Self {
        Self::new()
    }
}

impl NamePool for RandomNames {
    fn next_name(&mut self) -> Result<String, Error> {
        let target = NAME_PREFIX.len() + NAME_SUFFIX_LEN;
        let mut name = String::with_capacity(target);
        name.push_str(NAME_PREFIX);

        while name.len() < target {
            let mut buf = [0u8; 16];
            self.rng
                .fill(&mut buf)
                .map_err(|_| Error::Resource("system random source unavailable".to_string()))?;

            for b in buf.iter().filter(|b| **b < UNBIASED_LIMIT) {
                if name.len() == target {
                    break;
                }
                name.push(ALPHABET[*b as usize % ALPHABET.len()] as char);
            }
        }

        Ok(name)
    }
}

pub struct Provisioner<'a, N: ?Sized> {
    net: &'a N,
}

impl<'a, N: LinkOps + ?Sized> Provisioner<'a, N> {
    pub fn new(net: &'a N) -> Self {
        Self { net }
    }

    /// Make sure the wireguard module is loaded
    ///
    /// Not fatal: the module may be built into the kernel, and a real problem
    /// shows up when the link is created.
    pub fn ensure_module(&self) {
        if let Err(e) = self.net.load_module("wireguard") {
            warn!("Could not load wireguard kernel module: {}", e);
        }
    }

    /// Create a WireGuard link under a fresh random name
    pub fn create(&self, names: &mut dyn NamePool) -> Result<String, Error> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let name = names.next_name()?;
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                return Err(Error::Resource(format!("invalid interface name {:?}", name)));
            }

            let taken = self
                .net
                .link_exists(Namespace::Host, &name)
                .map_err(|e| Error::resource("could not check interface name", e))?;
            if taken {
                debug!("Interface name {} taken (attempt {})", name, attempt);
                continue;
            }

            match self.net.create_wireguard(&name) {
                Ok(()) => {
                    info!("Created WireGuard interface {}", name);
                    return Ok(name);
                }
                Err(e) if e.is_already_exists() => {
                    debug!("Interface name {} claimed concurrently (attempt {})", name, attempt);
                }
                Err(e) => return Err(Error::resource("could not create wireguard interface", e)),
            }
        }

        Err(Error::Resource(format!(
            "no free interface name after {} attempts",
            MAX_NAME_ATTEMPTS
        )))
    }

    /// Apply private key and peers to a host-side link
    pub fn configure(&self, name: &str, tunnel: &Tunnel) -> Result<(), Error> {
        self.net
            .configure_wireguard(name, &render_config(tunnel))
            .map_err(|e| Error::Crypto(format!("could not configure wireguard link {}: {}", name, e)))?;

        info!("Configured {} with {} peer(s)", name, tunnel.peers.len());
        Ok(())
    }

    /// Delete a host-side link that never made it into the sandbox
    pub fn discard(&self, name: &str) {
        match self.net.link_delete(Namespace::Host, name) {
            Ok(()) => info!("Removed host-side interface {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Could not remove host-side interface {}: {}", name, e),
        }
    }
}

/// Render a `wg setconf` document
///
/// Holds the private and preshared keys in the clear, so the buffer is
/// wiped once the device has been configured.
pub fn render_config(tunnel: &Tunnel) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(256 * (tunnel.peers.len() + 1)));
    let _ = writeln!(*out, "[Interface]");
    let _ = writeln!(*out, "PrivateKey = {}", tunnel.private_key.expose_base64().as_str());

    for peer in &tunnel.peers {
        let _ = writeln!(*out);
        let _ = writeln!(*out, "[Peer]");
        let _ = writeln!(*out, "PublicKey = {}", peer.public_key);
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(*out, "PresharedKey = {}", psk.expose_base64().as_str());
        }
        let _ = writeln!(*out, "Endpoint = {}", peer.endpoint);
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(*out, "PersistentKeepalive = {}", keepalive.as_secs());
        }
        if !peer.allowed_ips.is_empty() {
            let ranges: Vec<String> = peer.allowed_ips.iter().map(|r| r.to_string()).collect();
            let _ = writeln!(*out, "AllowedIPs = {}", ranges.join(", "));
        }
    }

    out
}
