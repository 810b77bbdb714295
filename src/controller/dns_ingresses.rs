//! Publishes DNS names for ingresses: one Unbound host override per rule
//! host, pointing at the ingress controller's load-balancer address.
use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cluster::{self, Cluster},
    diff,
    opnsense::{self, OpnsenseClient, Record},
};

use super::unbound;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list ingresses: {0}")]
    ListIngresses(#[source] cluster::Error),

    #[error("failed to search host overrides: {0}")]
    SearchOverrides(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(super) struct DnsIngressesPlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
}

impl DnsIngressesPlugin {
    pub fn new(cluster: Cluster, opnsense: OpnsenseClient) -> Self {
        Self { cluster, opnsense }
    }

    #[tracing::instrument(name = "dns_ingresses", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling host overrides for ingresses");
        let ingresses = self
            .cluster
            .ingresses()
            .await
            .map_err(Error::ListIngresses)?;
        let desired = desired_overrides(&ingresses);

        let current = unbound::current_host_overrides(&self.opnsense)
            .await
            .map_err(Error::SearchOverrides)?;

        let handler = unbound::HostOverrides {
            opnsense: &self.opnsense,
        };
        diff::apply(&desired, &current, &handler).await;
        Ok(())
    }
}

fn desired_overrides(ingresses: &[Ingress]) -> BTreeMap<String, Record> {
    let mut desired = BTreeMap::new();
    for ingress in ingresses {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
        let name = ingress.metadata.name.as_deref().unwrap_or_default();

        let ip = match load_balancer_ip(ingress) {
            Some(ip) => ip,
            None => {
                warn!("ingress {}/{} has no load balancer address", namespace, name);
                continue;
            }
        };

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_deref())
            .unwrap_or_default();
        for rule in rules {
            let hostname = match rule.host.as_deref() {
                Some(host) if !host.is_empty() => host,
                _ => continue,
            };
            let (host, domain) = match unbound::split_fqdn(hostname) {
                Some(split) => split,
                None => {
                    warn!(
                        "hostname `{}` for ingress {}/{} is not fully qualified, skipping",
                        hostname, namespace, name
                    );
                    continue;
                }
            };
            desired.insert(
                hostname.to_owned(),
                unbound::host_override(
                    host,
                    domain,
                    ip,
                    format!("Managed by K8s Ingress {}/{}", namespace, name),
                ),
            );
        }
    }
    desired
}

fn load_balancer_ip(ingress: &Ingress) -> Option<&str> {
    ingress
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .ip
        .as_deref()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{super::test_util::ingress, *};

    #[test]
    fn derives_one_override_per_rule_host() {
        let ingresses = vec![
            ingress("web", &["app.example.com", "api.example.com"], Some("2.2.2.2"), None),
            ingress("pending", &["wait.example.com"], None, None),
        ];
        let desired = desired_overrides(&ingresses);

        assert_eq!(
            desired.keys().collect::<Vec<_>>(),
            vec!["api.example.com", "app.example.com"]
        );
        let override_ = &desired["app.example.com"];
        assert_eq!(override_["host"], json!("app"));
        assert_eq!(override_["domain"], json!("example.com"));
        assert_eq!(override_["ip"], json!("2.2.2.2"));
        assert_eq!(
            override_["description"],
            json!("Managed by K8s Ingress default/web")
        );
    }

    #[test]
    fn skips_empty_and_single_label_hosts() {
        let ingresses = vec![ingress("web", &["", "x"], Some("2.2.2.2"), None)];
        assert!(desired_overrides(&ingresses).is_empty());
    }
}
