//! Controller configuration, loaded once at startup from a ConfigMap held
//! in the cluster. Each plugin section gates registration with its
//! `enabled` flag.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::opnsense::Record;

pub const DEFAULT_NAMESPACE: &str = "kube-system";
pub const DEFAULT_CONFIGMAP: &str = "kubernetes-opnsense-controller";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read ConfigMap {namespace}/{name}: {source}")]
    ReadConfigMap {
        namespace: String,
        name: String,
        source: kube::Error,
    },

    #[error("ConfigMap {namespace}/{name} has no `config` key")]
    MissingConfigKey { namespace: String, name: String },

    #[error("failed to parse config: {0}")]
    ParseConfig(#[source] serde_yaml::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub metallb: Option<MetalLbConfig>,
    pub haproxy_declarative: Option<HaproxyDeclarativeConfig>,
    pub haproxy_ingress_proxy: Option<HaproxyIngressProxyConfig>,
    pub opnsense_dns_services: Option<DnsServicesConfig>,
    pub opnsense_dns_ingresses: Option<DnsIngressesConfig>,
    pub opnsense_dns_haproxy_ingress_proxy: Option<DnsHaproxyIngressProxyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetalLbConfig {
    pub enabled: bool,
    pub bgp_implementation: Option<String>,
    pub options: BTreeMap<String, BgpOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BgpOptions {
    /// Merged into every neighbor payload the plugin derives.
    pub template: Record,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HaproxyDeclarativeConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaproxyIngressProxyConfig {
    pub enabled: bool,
    pub default_frontend: Option<String>,
    pub default_backend: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsServicesConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsIngressesConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsHaproxyIngressProxyConfig {
    pub enabled: bool,
    pub frontends: BTreeMap<String, FrontendConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub hostname: Option<String>,
}

/// Read the controller ConfigMap named by `CONTROLLER_NAMESPACE` /
/// `CONTROLLER_CONFIGMAP` and parse its `config` entry.
pub async fn load(client: Client) -> Result<Config> {
    let namespace =
        std::env::var("CONTROLLER_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_owned());
    let name =
        std::env::var("CONTROLLER_CONFIGMAP").unwrap_or_else(|_| DEFAULT_CONFIGMAP.to_owned());
    info!("loading configuration from ConfigMap {}/{}", namespace, name);

    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let cm = api
        .get(&name)
        .await
        .map_err(|source| Error::ReadConfigMap {
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        })?;
    let raw = cm
        .data
        .as_ref()
        .and_then(|data| data.get("config"))
        .ok_or(Error::MissingConfigKey { namespace, name })?;
    serde_yaml::from_str(raw).map_err(Error::ParseConfig)
}
