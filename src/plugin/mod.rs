//! WireGuard chained plugin
//!
//! Attach runs the Interface Provisioner, the Namespace Relocator and the
//! Route Installer in that order, stopping at the first failure. Detach
//! runs the Teardown Handler on its own.

pub mod provision;
pub mod relocate;
pub mod routes;
pub mod teardown;

use ipnetwork::IpNetwork;
use serde_json::Map;
use std::path::Path;
use tracing::info;

use crate::config::{NetConf, Tunnel};
use crate::error::Error;
use crate::link::{LinkOps, Namespace};
use crate::resolver::ConfigSource;
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult};

pub use provision::{NamePool, Provisioner, RandomNames};
pub use relocate::Relocator;

/// What an attach left behind in the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Interface name inside the sandbox
    pub name: String,
    pub address: IpNetwork,
    /// Routes added on top of the on-link route
    pub routes: Vec<IpNetwork>,
}

/// WireGuard plugin implementation
pub struct WireguardPlugin<N> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    net: N,
}

impl<N: LinkOps> WireguardPlugin<N> {
    /// Create a new WireGuard plugin
    pub fn new(config: NetConf, args: CmdArgs, net: N) -> Self {
        Self { config, args, net }
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    /// Add a WireGuard interface to the sandbox
    ///
    /// Returns the previous result with the new interface and its address
    /// appended, or the previous result untouched when the workload has not
    /// opted in.
    pub fn add_network(&self, source: &dyn ConfigSource) -> Result<CniResult, Error> {
        let mut result = self.config.prev_result()?;

        let tunnel = match source.load(&self.args)? {
            Some(config) => config.validate()?,
            None => {
                info!("Container {} not configured for WireGuard, passing through", self.args.container_id);
                return Ok(result);
            }
        };

        let attachment = self.attach(&tunnel, &mut RandomNames::new())?;

        let index = result.add_interface(Interface {
            name: attachment.name,
            mac: None,
            sandbox: Some(self.args.netns.clone()),
            extra: Map::new(),
        });
        result.add_ip(IPConfig {
            interface: Some(index),
            address: attachment.address.to_string(),
            gateway: None,
            extra: Map::new(),
        });

        Ok(result)
    }

    /// Provision, relocate, address, activate and route a validated tunnel
    pub fn attach(&self, tunnel: &Tunnel, names: &mut dyn NamePool) -> Result<Attachment, Error> {
        let netns = Path::new(&self.args.netns);

        let provisioner = Provisioner::new(&self.net);
        provisioner.ensure_module();
        let name = provisioner.create(names)?;

        let relocator = Relocator::new(&self.net, netns);

        // Until the move succeeds the link lives on the host, where nothing
        // else would ever reclaim it.
        if let Err(e) = provisioner
            .configure(&name, tunnel)
            .and_then(|_| relocator.relocate(&name))
        {
            provisioner.discard(&name);
            return Err(e);
        }

        relocator.assign_address(&name, &tunnel.address)?;
        relocator.activate(&name)?;

        let routes = routes::install(&self.net, netns, &name, tunnel)?;

        info!(
            "Attached {} to {} with address {} and {} route(s)",
            name,
            netns.display(),
            tunnel.address,
            routes.len()
        );

        Ok(Attachment {
            name,
            address: tunnel.address,
            routes,
        })
    }

    /// Delete the WireGuard interface from the sandbox
    pub fn del_network(&self) -> Result<(), Error> {
        teardown::teardown(&self.net, Path::new(&self.args.netns));
        Ok(())
    }

    /// Check the sandbox still has its WireGuard interface
    pub fn check_network(&self, source: &dyn ConfigSource) -> Result<(), Error> {
        let tunnel = match source.load(&self.args)? {
            Some(config) => config.validate()?,
            None => return Ok(()),
        };

        let netns = Path::new(&self.args.netns);
        let links = self
            .net
            .wireguard_links(Namespace::Path(netns))
            .map_err(|e| Error::resource("could not list interfaces", e))?;

        let name = match links.as_slice() {
            [name] => name,
            [] => return Err(Error::Resource(format!("no WireGuard interface in {}", netns.display()))),
            _ => {
                return Err(Error::Resource(format!(
                    "{} WireGuard interfaces in {}, expected one",
                    links.len(),
                    netns.display()
                )))
            }
        };

        let state = self
            .net
            .link_state(netns, name)
            .map_err(|e| Error::resource(&format!("could not inspect {}", name), e))?;

        if !state.up {
            return Err(Error::Resource(format!("interface {} is not up", name)));
        }
        if !state.addresses.contains(&tunnel.address) {
            return Err(Error::Network(format!(
                "interface {} does not have address {}",
                name, tunnel.address
            )));
        }

        Ok(())
    }
}
