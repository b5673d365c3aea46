//! Namespace Relocator
//!
//! relocate, then assign_address, then activate. Each step only makes sense
//! once the previous one has completed.

use ipnetwork::IpNetwork;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Error;
use crate::link::LinkOps;

pub struct Relocator<'a, N: ?Sized> {
    net: &'a N,
    netns: &'a Path,
}

impl<'a, N: LinkOps + ?Sized> Relocator<'a, N> {
    pub fn new(net: &'a N, netns: &'a Path) -> Self {
        Self { net, netns }
    }

    /// Move the link from the host into the sandbox namespace
    pub fn relocate(&self, name: &str) -> Result<(), Error> {
        self.net.move_to_netns(name, self.netns).map_err(|e| {
            Error::resource(
                &format!("could not move {} into namespace {}", name, self.netns.display()),
                e,
            )
        })?;

        info!("Moved {} into {}", name, self.netns.display());
        Ok(())
    }

    /// Assign the local address; the kernel adds the on-link route with it
    pub fn assign_address(&self, name: &str, addr: &IpNetwork) -> Result<(), Error> {
        match self.net.addr_add(self.netns, name, addr) {
            Ok(()) => info!("Assigned {} to {}", addr, name),
            Err(e) if e.is_already_exists() => debug!("{} already has {}", name, addr),
            Err(e) => return Err(Error::network(&format!("could not add address {} to {}", addr, name), e)),
        }
        Ok(())
    }

    pub fn activate(&self, name: &str) -> Result<(), Error> {
        self.net
            .link_up(self.netns, name)
            .map_err(|e| Error::resource(&format!("could not set {} up", name), e))?;

        info!("Set {} up", name);
        Ok(())
    }
}
