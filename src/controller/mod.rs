// The control loop: plugin registration, the initial baseline reconcile,
// and one watcher task per subscribed resource kind.
use std::{collections::BTreeMap, sync::Arc};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cluster::{Cluster, WatchKind},
    config::Config,
    opnsense::OpnsenseClient,
};

mod dns_haproxy_ingress_proxy;
mod dns_ingresses;
mod dns_services;
mod haproxy;
mod haproxy_declarative;
mod haproxy_ingress_proxy;
mod metallb;
mod unbound;

use dns_haproxy_ingress_proxy::DnsHaproxyIngressProxyPlugin;
use dns_ingresses::DnsIngressesPlugin;
use dns_services::DnsServicesPlugin;
use haproxy_declarative::HaproxyDeclarativePlugin;
use haproxy_ingress_proxy::HaproxyIngressProxyPlugin;
use metallb::MetalLbPlugin;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to configure metallb plugin: {0}")]
    ConfigureMetalLb(#[source] metallb::Error),

    #[error("metallb: {0}")]
    MetalLb(#[source] metallb::Error),

    #[error("haproxy-declarative: {0}")]
    HaproxyDeclarative(#[source] haproxy_declarative::Error),

    #[error("haproxy-ingress-proxy: {0}")]
    HaproxyIngressProxy(#[source] haproxy_ingress_proxy::Error),

    #[error("opnsense-dns-services: {0}")]
    DnsServices(#[source] dns_services::Error),

    #[error("opnsense-dns-ingresses: {0}")]
    DnsIngresses(#[source] dns_ingresses::Error),

    #[error("opnsense-dns-haproxy-ingress-proxy: {0}")]
    DnsHaproxyIngressProxy(#[source] dns_haproxy_ingress_proxy::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An enabled feature. Stored as tagged variants so a watcher can fan out
/// to its subscribers without a trait object.
enum Plugin {
    MetalLb(MetalLbPlugin),
    HaproxyDeclarative(HaproxyDeclarativePlugin),
    HaproxyIngressProxy(HaproxyIngressProxyPlugin),
    DnsServices(DnsServicesPlugin),
    DnsIngresses(DnsIngressesPlugin),
    DnsHaproxyIngressProxy(DnsHaproxyIngressProxyPlugin),
}

impl Plugin {
    fn name(&self) -> &'static str {
        match self {
            Plugin::MetalLb(_) => "metallb",
            Plugin::HaproxyDeclarative(_) => "haproxy-declarative",
            Plugin::HaproxyIngressProxy(_) => "haproxy-ingress-proxy",
            Plugin::DnsServices(_) => "opnsense-dns-services",
            Plugin::DnsIngresses(_) => "opnsense-dns-ingresses",
            Plugin::DnsHaproxyIngressProxy(_) => "opnsense-dns-haproxy-ingress-proxy",
        }
    }

    fn watches(&self) -> &'static [WatchKind] {
        match self {
            Plugin::MetalLb(_) => &[WatchKind::Node],
            Plugin::HaproxyDeclarative(_) => &[WatchKind::ConfigMap],
            Plugin::DnsServices(_) => &[WatchKind::Service],
            Plugin::HaproxyIngressProxy(_)
            | Plugin::DnsIngresses(_)
            | Plugin::DnsHaproxyIngressProxy(_) => &[WatchKind::Ingress],
        }
    }

    async fn reconcile(&self) -> Result<()> {
        match self {
            Plugin::MetalLb(p) => p.reconcile().await.map_err(Error::MetalLb),
            Plugin::HaproxyDeclarative(p) => p.reconcile().await.map_err(Error::HaproxyDeclarative),
            Plugin::HaproxyIngressProxy(p) => {
                p.reconcile().await.map_err(Error::HaproxyIngressProxy)
            }
            Plugin::DnsServices(p) => p.reconcile().await.map_err(Error::DnsServices),
            Plugin::DnsIngresses(p) => p.reconcile().await.map_err(Error::DnsIngresses),
            Plugin::DnsHaproxyIngressProxy(p) => {
                p.reconcile().await.map_err(Error::DnsHaproxyIngressProxy)
            }
        }
    }
}

/// Register enabled plugins, reconcile each once to establish a baseline,
/// then watch the subscribed resource kinds until the process is stopped.
///
/// Returns early only on a fatal configuration error; per-reconcile errors
/// are logged and retried on the next event.
pub async fn run(client: Client, opnsense: OpnsenseClient, config: Config) -> Result<()> {
    let cluster = Cluster::new(client);
    let plugins = register(&cluster, &opnsense, &config)?;
    if plugins.is_empty() {
        warn!("no plugins are enabled; nothing to reconcile");
        return Ok(());
    }

    info!("performing initial reconciliation");
    for plugin in &plugins {
        if let Err(err) = plugin.reconcile().await {
            warn!("initial reconcile failed: {}", err);
        }
    }

    let mut subscriptions: BTreeMap<WatchKind, Vec<Arc<Plugin>>> = BTreeMap::new();
    for plugin in &plugins {
        for kind in plugin.watches() {
            subscriptions
                .entry(*kind)
                .or_default()
                .push(Arc::clone(plugin));
        }
    }

    let watchers = subscriptions
        .into_iter()
        .map(|(kind, subscribers)| tokio::spawn(watch_kind(cluster.clone(), kind, subscribers)))
        .collect::<Vec<_>>();
    futures::future::join_all(watchers).await;
    Ok(())
}

fn register(
    cluster: &Cluster,
    opnsense: &OpnsenseClient,
    config: &Config,
) -> Result<Vec<Arc<Plugin>>> {
    let mut plugins = Vec::new();

    if let Some(cfg) = config.metallb.as_ref().filter(|c| c.enabled) {
        let plugin = MetalLbPlugin::new(cluster.clone(), opnsense.clone(), cfg)
            .map_err(Error::ConfigureMetalLb)?;
        plugins.push(Arc::new(Plugin::MetalLb(plugin)));
    }
    if config
        .haproxy_declarative
        .as_ref()
        .map_or(false, |c| c.enabled)
    {
        plugins.push(Arc::new(Plugin::HaproxyDeclarative(
            HaproxyDeclarativePlugin::new(cluster.clone(), opnsense.clone()),
        )));
    }
    if let Some(cfg) = config.haproxy_ingress_proxy.as_ref().filter(|c| c.enabled) {
        plugins.push(Arc::new(Plugin::HaproxyIngressProxy(
            HaproxyIngressProxyPlugin::new(cluster.clone(), opnsense.clone(), cfg.clone()),
        )));
    }
    if config
        .opnsense_dns_services
        .as_ref()
        .map_or(false, |c| c.enabled)
    {
        plugins.push(Arc::new(Plugin::DnsServices(DnsServicesPlugin::new(
            cluster.clone(),
            opnsense.clone(),
        ))));
    }
    if config
        .opnsense_dns_ingresses
        .as_ref()
        .map_or(false, |c| c.enabled)
    {
        plugins.push(Arc::new(Plugin::DnsIngresses(DnsIngressesPlugin::new(
            cluster.clone(),
            opnsense.clone(),
        ))));
    }
    if let Some(cfg) = config
        .opnsense_dns_haproxy_ingress_proxy
        .as_ref()
        .filter(|c| c.enabled)
    {
        // Alias targets fall back to the ingress-proxy plugin's default
        // frontend.
        let proxy_cfg = config.haproxy_ingress_proxy.clone().unwrap_or_default();
        plugins.push(Arc::new(Plugin::DnsHaproxyIngressProxy(
            DnsHaproxyIngressProxyPlugin::new(
                cluster.clone(),
                opnsense.clone(),
                cfg.clone(),
                &proxy_cfg,
            ),
        )));
    }

    for plugin in &plugins {
        info!("registered plugin {}", plugin.name());
    }
    Ok(plugins)
}

async fn watch_kind(cluster: Cluster, kind: WatchKind, subscribers: Vec<Arc<Plugin>>) {
    info!(
        "watching {} events for {} plugin(s)",
        kind.as_str(),
        subscribers.len()
    );
    let mut events = cluster.events(kind);
    while let Some(event) = events.next().await {
        if let Err(err) = &event {
            warn!("{} watch error: {}", kind.as_str(), err);
        }
        // Any event triggers a full pass for every subscriber; reconciles
        // take their own snapshots instead of consulting the payload.
        debug!("{} event", kind.as_str());
        for plugin in &subscribers {
            if let Err(err) = plugin.reconcile().await {
                warn!("reconcile failed: {}", err);
            }
        }
    }
}

/// The address used to reach a node: `InternalIP` when present, otherwise
/// `ExternalIP`.
fn node_address(node: &Node) -> Option<&str> {
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default();
    addresses
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .or_else(|| addresses.iter().find(|addr| addr.type_ == "ExternalIP"))
        .map(|addr| addr.address.as_str())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_address_prefers_internal_ip() {
        let node = test_util::node(
            "node-1",
            &[("ExternalIP", "203.0.113.7"), ("InternalIP", "10.0.0.1")],
        );
        assert_eq!(node_address(&node), Some("10.0.0.1"));
    }

    #[test]
    fn node_address_falls_back_to_external_ip() {
        let node = test_util::node("node-1", &[("ExternalIP", "203.0.113.7")]);
        assert_eq!(node_address(&node), Some("203.0.113.7"));
    }

    #[test]
    fn node_without_usable_address_yields_none() {
        let node = test_util::node("node-1", &[("Hostname", "node-1.local")]);
        assert_eq!(node_address(&node), None);
        assert_eq!(node_address(&Node::default()), None);
    }
}
