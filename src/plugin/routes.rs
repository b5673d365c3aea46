//! Route Installer

use ipnetwork::IpNetwork;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Tunnel;
use crate::error::Error;
use crate::link::LinkOps;

/// Routes needed for a tunnel, in peer order
///
/// Ranges containing the local address are skipped: assigning the address
/// already created the on-link route that covers them.
pub fn plan(tunnel: &Tunnel) -> Vec<IpNetwork> {
    let local = tunnel.address.ip();

    tunnel
        .peers
        .iter()
        .flat_map(|peer| peer.allowed_ips.iter())
        .filter(|range| !range.contains(local))
        .copied()
        .collect()
}

/// Install every planned route through `name` inside `netns`
///
/// A route that already exists counts as installed.
pub fn install<N: LinkOps + ?Sized>(
    net: &N,
    netns: &Path,
    name: &str,
    tunnel: &Tunnel,
) -> Result<Vec<IpNetwork>, Error> {
    let routes = plan(tunnel);

    for dst in &routes {
        match net.route_add(netns, name, dst) {
            Ok(()) => info!("Added route {} dev {}", dst, name),
            Err(e) if e.is_already_exists() => debug!("Route {} dev {} already present", dst, name),
            Err(e) => return Err(Error::network(&format!("could not add route {} dev {}", dst, name), e)),
        }
    }

    Ok(routes)
}
