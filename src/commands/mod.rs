use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use serde_json::Value;
use tracing::info;

use crate::config::NetConf;
use crate::error::Error;
use crate::link::IpCommand;
use crate::plugin::WireguardPlugin;
use crate::resolver;
use crate::types::{CmdArgs, ErrorResult, VersionResult, DEFAULT_CNI_VERSION};

fn required_env(key: &str) -> Result<String, Error> {
    env::var(key).map_err(|_| Error::Environment(format!("{} not found in environment", key)))
}

/// Parse command arguments from environment
///
/// DEL may run after the sandbox is gone, so it accepts a missing netns.
pub fn parse_args(allow_missing_netns: bool) -> Result<CmdArgs, Error> {
    let container_id = required_env("CNI_CONTAINERID")?;

    let netns = match required_env("CNI_NETNS") {
        Ok(netns) => netns,
        Err(_) if allow_missing_netns => String::new(),
        Err(e) => return Err(e),
    };

    let ifname = required_env("CNI_IFNAME")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    // Get args (if any)
    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    // Read stdin data
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(|e| Error::Configuration(format!("failed to read from stdin: {}", e)))?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// What a command leaves on stdout
pub enum Outcome {
    /// JSON to print on stdout
    Printed(String),
    Silent,
}

/// A failed command and the CNI version its error is reported in
#[derive(Debug)]
pub struct Failure {
    pub cni_version: String,
    pub error: Error,
}

impl Failure {
    /// The error payload for stdout
    pub fn result(&self) -> ErrorResult {
        ErrorResult::from_error(&self.cni_version, &self.error)
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            error,
        }
    }
}

/// The cniVersion the runtime asked for, if stdin carries one
fn requested_version(stdin: &[u8]) -> String {
    serde_json::from_slice::<Value>(stdin)
        .ok()
        .and_then(|conf| conf.get("cniVersion")?.as_str().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

/// Parse the network configuration and run `f` with it
///
/// Errors are reported in the cniVersion found on stdin, even when the rest
/// of the configuration is rejected.
pub fn with_net_conf<F>(args: CmdArgs, f: F) -> Result<Outcome, Failure>
where
    F: FnOnce(NetConf, CmdArgs) -> Result<Outcome, Error>,
{
    let cni_version = requested_version(&args.stdin_data);
    let fail = |error: Error| Failure {
        cni_version: cni_version.clone(),
        error,
    };

    let conf = NetConf::parse(&args.stdin_data).map_err(fail)?;
    f(conf, args).map_err(fail)
}

/// Execute the add command
pub fn cmd_add() -> Result<Outcome, Failure> {
    with_net_conf(parse_args(false)?, |conf, args| {
        let source = resolver::from_source_ref(&conf.source()?);

        let plugin = WireguardPlugin::new(conf, args, IpCommand::new());
        let result = plugin.add_network(source.as_ref())?;

        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| Error::Configuration(format!("could not encode result: {}", e)))?;
        Ok(Outcome::Printed(json))
    })
}

/// Execute the delete command
pub fn cmd_del() -> Result<Outcome, Failure> {
    with_net_conf(parse_args(true)?, |conf, args| {
        let plugin = WireguardPlugin::new(conf, args, IpCommand::new());
        plugin.del_network()?;

        Ok(Outcome::Silent)
    })
}

/// Execute the check command
pub fn cmd_check() -> Result<Outcome, Failure> {
    with_net_conf(parse_args(false)?, |conf, args| {
        let source = resolver::from_source_ref(&conf.source()?);

        let plugin = WireguardPlugin::new(conf, args, IpCommand::new());
        plugin.check_network(source.as_ref())?;

        Ok(Outcome::Silent)
    })
}

/// Output supported CNI versions
pub fn cmd_version() -> Result<Outcome, Failure> {
    let json = serde_json::to_string(&VersionResult::default())
        .map_err(|e| Error::Configuration(format!("could not encode versions: {}", e)))?;
    Ok(Outcome::Printed(json))
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<Outcome, Failure> {
    let cmd = required_env("CNI_COMMAND")?;
    info!("Running {}", cmd);

    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => cmd_version(),
        _ => Err(Error::Environment(format!("unknown CNI command: {}", cmd)).into()),
    }
}
