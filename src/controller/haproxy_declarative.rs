//! Materializes HAProxy backends and frontends from declarative ConfigMap
//! documents, expanding node-backed server lists from cluster state.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Service};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    cluster::{self, Cluster},
    diff,
    opnsense::{self, OpnsenseClient, Record},
};

use super::haproxy;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list declarative ConfigMaps: {0}")]
    ListConfigMaps(#[source] cluster::Error),

    #[error("failed to search backends: {0}")]
    SearchBackends(#[source] opnsense::Error),

    #[error("failed to search frontends: {0}")]
    SearchFrontends(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The `data.data` payload of a declarative ConfigMap.
#[derive(Debug, Deserialize)]
struct DeclarativeDocument {
    #[serde(default)]
    resources: Vec<DeclarativeResource>,
}

#[derive(Debug, Deserialize)]
struct DeclarativeResource {
    #[serde(rename = "type")]
    kind: ResourceKind,
    #[serde(default)]
    definition: Record,
    ha_servers: Option<Vec<HaServer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ResourceKind {
    Backend,
    Frontend,
}

/// One entry of a backend's `ha_servers` list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HaServer {
    #[serde(rename = "type")]
    kind: ServerKind,
    #[serde(default)]
    definition: Record,
    service_name: Option<String>,
    service_port: Option<i32>,
    service_namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ServerKind {
    NodeStatic,
    NodeService,
}

pub(super) struct HaproxyDeclarativePlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
}

impl HaproxyDeclarativePlugin {
    pub fn new(cluster: Cluster, opnsense: OpnsenseClient) -> Self {
        Self { cluster, opnsense }
    }

    #[tracing::instrument(name = "haproxy_declarative", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling declarative HAProxy resources");
        let config_maps = self
            .cluster
            .declarative_config_maps()
            .await
            .map_err(Error::ListConfigMaps)?;

        let mut backends = BTreeMap::new();
        let mut frontends = BTreeMap::new();
        for cm in &config_maps {
            let namespace = cm.metadata.namespace.as_deref().unwrap_or_default();
            let name = cm.metadata.name.as_deref().unwrap_or_default();
            let raw = match cm.data.as_ref().and_then(|data| data.get("data")) {
                Some(raw) => raw,
                None => continue,
            };
            let document: DeclarativeDocument = match serde_yaml::from_str(raw) {
                Ok(document) => document,
                Err(err) => {
                    warn!(
                        "failed to parse declarative ConfigMap {}/{}: {}",
                        namespace, name, err
                    );
                    continue;
                }
            };

            for resource in document.resources {
                match resource.kind {
                    ResourceKind::Backend => {
                        let definition = self.resolve_backend(resource, namespace).await;
                        match resource_name(&definition) {
                            Some(backend_name) => {
                                backends.insert(backend_name, definition);
                            }
                            None => {
                                warn!("backend without a name in {}/{}, skipping", namespace, name);
                            }
                        }
                    }
                    ResourceKind::Frontend => match resource_name(&resource.definition) {
                        Some(frontend_name) => {
                            frontends.insert(frontend_name, resource.definition);
                        }
                        None => {
                            warn!("frontend without a name in {}/{}, skipping", namespace, name);
                        }
                    },
                }
            }
        }

        // Backends first; frontends may reference them.
        let current_backends = haproxy::current_items(&self.opnsense, "backend")
            .await
            .map_err(Error::SearchBackends)?;
        let backend_handler = haproxy::Items {
            opnsense: &self.opnsense,
            kind: "backend",
            owned_prefix: None,
        };
        let backends_changed = diff::apply(&backends, &current_backends, &backend_handler).await;

        let current_frontends = haproxy::current_items(&self.opnsense, "frontend")
            .await
            .map_err(Error::SearchFrontends)?;
        let frontend_handler = haproxy::Items {
            opnsense: &self.opnsense,
            kind: "frontend",
            owned_prefix: None,
        };
        let frontends_changed =
            diff::apply(&frontends, &current_frontends, &frontend_handler).await;

        if backends_changed || frontends_changed {
            haproxy::reconfigure(&self.opnsense).await;
        }
        Ok(())
    }

    /// Expand a backend's `ha_servers` into its `definition.servers`.
    /// Unresolvable entries are skipped; the backend itself survives.
    async fn resolve_backend(&self, resource: DeclarativeResource, namespace: &str) -> Record {
        let mut definition = resource.definition;
        let ha_servers = match resource.ha_servers {
            Some(ha_servers) => ha_servers,
            None => return definition,
        };

        let mut servers = Vec::new();
        for server in ha_servers {
            match server.kind {
                ServerKind::NodeStatic => servers.push(Value::Object(server.definition)),
                ServerKind::NodeService => {
                    servers.extend(self.resolve_node_service(&server, namespace).await);
                }
            }
        }
        definition.insert("servers".to_owned(), Value::Array(servers));
        definition
    }

    /// One server per cluster node, addressed via the service's node port.
    async fn resolve_node_service(&self, server: &HaServer, namespace: &str) -> Vec<Value> {
        let (service_name, service_port) = match (&server.service_name, server.service_port) {
            (Some(name), Some(port)) => (name.as_str(), port),
            _ => {
                warn!("node-service entry is missing serviceName or servicePort, skipping");
                return Vec::new();
            }
        };
        let service_namespace = server.service_namespace.as_deref().unwrap_or(namespace);

        let service = match self.cluster.service(service_namespace, service_name).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                warn!(
                    "service {}/{} not found, skipping node-service entry",
                    service_namespace, service_name
                );
                return Vec::new();
            }
            Err(err) => {
                error!(
                    "failed to get service {}/{}: {}",
                    service_namespace, service_name, err
                );
                return Vec::new();
            }
        };
        let node_port = match matching_node_port(&service, service_port) {
            Some(node_port) => node_port,
            None => {
                warn!(
                    "service {}/{} has no nodePort for port {}",
                    service_namespace, service_name, service_port
                );
                return Vec::new();
            }
        };

        let nodes = match self.cluster.nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("failed to list nodes: {}", err);
                return Vec::new();
            }
        };
        node_service_servers(&server.definition, service_port, node_port, &nodes)
    }
}

/// One server entry per addressable node: the entry template plus the
/// node's name, address and the service's node port.
fn node_service_servers(
    template: &Record,
    service_port: i32,
    node_port: i32,
    nodes: &[Node],
) -> Vec<Value> {
    let mut servers = Vec::new();
    for node in nodes {
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        let address = match super::node_address(node) {
            Some(address) => address,
            None => continue,
        };
        let mut entry = template.clone();
        entry.insert(
            "name".to_owned(),
            Value::String(format!("{}-{}", node_name, service_port)),
        );
        entry.insert("address".to_owned(), Value::String(address.to_owned()));
        entry.insert("port".to_owned(), Value::from(node_port));
        servers.push(Value::Object(entry));
    }
    servers
}

fn resource_name(definition: &Record) -> Option<String> {
    definition
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn matching_node_port(service: &Service, service_port: i32) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|port| port.port == service_port)?
        .node_port
}
