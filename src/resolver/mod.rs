//! Tunnel configuration lookup
//!
//! A pod opts in by carrying the `wg-cni.io/config-secret` annotation. The
//! named secret, in the pod's namespace, holds the tunnel config under the
//! `config.json` key. Networks that give every pod the same tunnel use a
//! static file instead.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{SourceRef, TunnelConfig};
use crate::error::Error;
use crate::link::exec;
use crate::types::CmdArgs;

/// Pod annotation naming the secret that holds the tunnel config
pub const CONFIG_SECRET_ANNOTATION: &str = "wg-cni.io/config-secret";

/// Secret data key holding the tunnel config JSON
pub const CONFIG_SECRET_KEY: &str = "config.json";

/// Something that can produce the tunnel config for a sandbox
pub trait ConfigSource {
    /// Returns `None` when the workload has not opted in
    fn load(&self, args: &CmdArgs) -> Result<Option<TunnelConfig>, Error>;
}

/// Read access to the cluster objects the lookup needs
pub trait ClusterApi {
    fn pod_annotations(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>, Error>;

    /// Decoded value of one key of a secret
    fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, Error>;
}

/// Tunnel config stored in a file on the node
#[derive(Debug, Clone)]
pub struct StaticFile {
    path: PathBuf,
}

impl StaticFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for StaticFile {
    fn load(&self, _args: &CmdArgs) -> Result<Option<TunnelConfig>, Error> {
        let bytes = fs::read(&self.path).map_err(|e| {
            Error::Configuration(format!("could not read static config {}: {}", self.path.display(), e))
        })?;
        TunnelConfig::from_json(&bytes).map(Some)
    }
}

/// Tunnel config looked up through the pod's annotation
pub struct Cluster<C> {
    api: C,
}

impl<C: ClusterApi> Cluster<C> {
    pub fn new(api: C) -> Self {
        Self { api }
    }
}

impl<C: ClusterApi> ConfigSource for Cluster<C> {
    fn load(&self, args: &CmdArgs) -> Result<Option<TunnelConfig>, Error> {
        let pod_arg = |key: &str| {
            args.args
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::Configuration(format!("{} missing from CNI_ARGS", key)))
        };
        let namespace = pod_arg("K8S_POD_NAMESPACE")?;
        let pod = pod_arg("K8S_POD_NAME")?;

        let annotations = self.api.pod_annotations(&namespace, &pod)?;
        let secret = match annotations.get(CONFIG_SECRET_ANNOTATION).filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                debug!("Pod {}/{} is not annotated with {}", namespace, pod, CONFIG_SECRET_ANNOTATION);
                return Ok(None);
            }
        };

        info!("Loading tunnel config for {}/{} from secret {}", namespace, pod, secret);
        let bytes = self.api.secret_value(&namespace, secret, CONFIG_SECRET_KEY)?;
        TunnelConfig::from_json(&bytes).map(Some)
    }
}

/// Build the source a network configuration points at
pub fn from_source_ref(source: &SourceRef) -> Box<dyn ConfigSource> {
    match source {
        SourceRef::Static(path) => Box::new(StaticFile::new(path)),
        SourceRef::Dynamic(kubeconfig) => Box::new(Cluster::new(Kubectl::new(kubeconfig))),
    }
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct Secret {
    #[serde(default)]
    data: HashMap<String, String>,
}

/// `ClusterApi` backed by `kubectl`
#[derive(Debug, Clone)]
pub struct Kubectl {
    kubeconfig: PathBuf,
}

impl Kubectl {
    pub fn new(kubeconfig: &Path) -> Self {
        Self {
            kubeconfig: kubeconfig.to_path_buf(),
        }
    }

    fn get(&self, namespace: &str, kind: &str, name: &str) -> Result<Vec<u8>, Error> {
        let kubeconfig = self.kubeconfig.to_string_lossy();
        exec(
            "kubectl",
            &["--kubeconfig", kubeconfig.as_ref(), "-n", namespace, "get", kind, name, "-o", "json"],
            None,
        )
        .map_err(|e| Error::Configuration(format!("could not get {} {}/{}: {}", kind, namespace, name, e)))
    }
}

impl ClusterApi for Kubectl {
    fn pod_annotations(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>, Error> {
        let pod: Pod = serde_json::from_slice(&self.get(namespace, "pod", name)?)
            .map_err(|e| Error::Configuration(format!("could not parse pod {}/{}: {}", namespace, name, e)))?;
        Ok(pod.metadata.annotations)
    }

    fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, Error> {
        let secret: Secret = serde_json::from_slice(&self.get(namespace, "secret", name)?)
            .map_err(|e| Error::Configuration(format!("could not parse secret {}/{}: {}", namespace, name, e)))?;

        let encoded = secret
            .data
            .get(key)
            .ok_or_else(|| Error::Configuration(format!("secret {}/{} has no {:?} key", namespace, name, key)))?;

        STANDARD
            .decode(encoded)
            .map_err(|e| Error::Configuration(format!("secret {}/{} key {:?} is not base64: {}", namespace, name, key, e)))
    }
}
