//! Teardown Handler
//!
//! Usually the runtime has already destroyed the sandbox namespace, taking
//! the interface, address and routes with it. Whatever is left is removed
//! here; nothing in this path is allowed to fail the DEL.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::link::{LinkOps, Namespace};

/// Remove every WireGuard link left in `netns`
pub fn teardown<N: LinkOps + ?Sized>(net: &N, netns: &Path) {
    if netns.as_os_str().is_empty() || !netns.exists() {
        debug!("Namespace {} is gone, nothing to clean up", netns.display());
        return;
    }

    let links = match net.wireguard_links(Namespace::Path(netns)) {
        Ok(links) => links,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!("Could not list interfaces in {}: {}", netns.display(), e);
            return;
        }
    };

    for name in links {
        match net.link_delete(Namespace::Path(netns), &name) {
            Ok(()) => info!("Deleted {} in {}", name, netns.display()),
            Err(e) if e.is_not_found() => debug!("{} already gone", name),
            Err(e) => warn!("Could not delete {} in {}: {}", name, netns.display(), e),
        }
    }
}
