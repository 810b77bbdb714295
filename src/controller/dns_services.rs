//! Publishes DNS names for LoadBalancer services: one Unbound host
//! override per annotated service, pointing at its load-balancer address.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cluster::{self, Cluster},
    diff,
    opnsense::{self, OpnsenseClient, Record},
};

use super::unbound;

/// Annotation holding the FQDN to publish for a service.
pub const HOSTNAME_ANNOTATION: &str = "dns.opnsense.org/hostname";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list services: {0}")]
    ListServices(#[source] cluster::Error),

    #[error("failed to search host overrides: {0}")]
    SearchOverrides(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(super) struct DnsServicesPlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
}

impl DnsServicesPlugin {
    pub fn new(cluster: Cluster, opnsense: OpnsenseClient) -> Self {
        Self { cluster, opnsense }
    }

    #[tracing::instrument(name = "dns_services", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling host overrides for services");
        let services = self.cluster.services().await.map_err(Error::ListServices)?;
        let desired = desired_overrides(&services);

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

fn desired_overrides(services: &[Service]) -> BTreeMap<String, Record> {
    let mut desired = BTreeMap::new();
    for service in services {
        let service_type = service.spec.as_ref().and_then(|spec| spec.type_.as_deref());
        if service_type != Some("LoadBalancer") {
            continue;
        }
        let hostname = match service
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(HOSTNAME_ANNOTATION))
        {
            Some(hostname) => hostname,
            None => continue,
        };

        let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        let name = service.metadata.name.as_deref().unwrap_or_default();

        let ip = match load_balancer_ip(service) {
            Some(ip) => ip,
            None => {
                warn!("service {}/{} has no load balancer address", namespace, name);
                continue;
            }
        };
        let (host, domain) = match unbound::split_fqdn(hostname) {
            Some(split) => split,
            None => {
                warn!(
                    "hostname `{}` for service {}/{} is not fully qualified, skipping",
                    hostname, namespace, name
                );
                continue;
            }
        };

        desired.insert(
            hostname.clone(),
            unbound::host_override(
                host,
                domain,
                ip,
                format!("Managed by K8s Service {}/{}", namespace, name),
            ),
        );
    }
    desired
}

fn load_balancer_ip(service: &Service) -> Option<&str> {
    service
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
    use k8s_openapi::{
        api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use serde_json::json;

    use super::*;

    fn service(name: &str, type_: &str, hostname: Option<&str>, ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                annotations: hostname.map(|h| {
                    vec![(HOSTNAME_ANNOTATION.to_owned(), h.to_owned())]
                        .into_iter()
                        .collect()
                }),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_owned()),
                ..ServiceSpec::default()
            }),
            status: ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_owned()),
                        ..LoadBalancerIngress::default()
                    }]),
                }),
                ..ServiceStatus::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn derives_overrides_for_annotated_load_balancers() {
        let services = vec![
            service("web-add", "LoadBalancer", Some("add.example.com"), Some("1.1.1.1")),
            service("clusterip", "ClusterIP", Some("skip.example.com"), None),
            service("no-ann", "LoadBalancer", None, Some("3.3.3.3")),
        ];
        let desired = desired_overrides(&services);

        assert_eq!(desired.len(), 1);
        let override_ = &desired["add.example.com"];
        assert_eq!(override_["host"], json!("add"));
        assert_eq!(override_["domain"], json!("example.com"));
        assert_eq!(override_["ip"], json!("1.1.1.1"));
        assert_eq!(
            override_["description"],
            json!("Managed by K8s Service default/web-add")
        );
    }

    #[test]
    fn skips_services_without_a_load_balancer_address() {
        let services = vec![service("pending", "LoadBalancer", Some("p.example.com"), None)];
        assert!(desired_overrides(&services).is_empty());
    }

    #[test]
    fn skips_single_label_hostnames() {
        let services = vec![service("short", "LoadBalancer", Some("x"), Some("1.1.1.1"))];
        assert!(desired_overrides(&services).is_empty());
    }

    #[test]
    fn desired_state_is_deterministic() {
        let services = vec![
            service("b", "LoadBalancer", Some("b.example.com"), Some("2.2.2.2")),
            service("a", "LoadBalancer", Some("a.example.com"), Some("1.1.1.1")),
        ];
        assert_eq!(desired_overrides(&services), desired_overrides(&services));
    }

    // The full pass: add the new override, retarget the stale one, delete
    // the orphan, leave manual records alone, reconfigure once.
    #[derive(Default)]
    struct Recorder {
        ops: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::diff::DiffHandler for Recorder {
        fn equal(&self, current: &Record, desired: &Record) -> bool {
            current.get("ip") == desired.get("ip")
        }

        fn owned(&self, current: &Record) -> bool {
            unbound::owned(current)
        }

        async fn add(&self, key: &str, _desired: &Record) -> opnsense::Result<()> {
            self.ops.lock().unwrap().push(format!("add:{}", key));
            Ok(())
        }

        async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
            let ip = desired
                .get("ip")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            self.ops.lock().unwrap().push(format!("set:{}:{}", uuid, ip));
            Ok(())
        }

        async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
            self.ops.lock().unwrap().push(format!("del:{}", uuid));
            Ok(())
        }

        async fn on_change(&self) -> opnsense::Result<()> {
            self.ops.lock().unwrap().push("reconfigure".to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn converges_services_against_existing_overrides() {
        use super::super::test_util::record;

        let services = vec![
            service("web-add", "LoadBalancer", Some("add.example.com"), Some("1.1.1.1")),
            service("web-upd", "LoadBalancer", Some("update.example.com"), Some("2.2.2.2")),
            service("clusterip", "ClusterIP", Some("skip.example.com"), None),
            service("no-ann", "LoadBalancer", None, Some("4.4.4.4")),
        ];
        let desired = desired_overrides(&services);

        let mut current = BTreeMap::new();
        current.insert(
            "update.example.com".to_owned(),
            record(json!({
                "uuid": "uuid-u",
                "host": "update",
                "domain": "example.com",
                "ip": "8.8.8.8",
                "description": "Managed by K8s Service default/web-upd"
            })),
        );
        current.insert(
            "delete.example.com".to_owned(),
            record(json!({
                "uuid": "uuid-d",
                "host": "delete",
                "domain": "example.com",
                "ip": "9.9.9.9",
                "description": "Managed by K8s Service other/x"
            })),
        );
        current.insert(
            "manual.example.com".to_owned(),
            record(json!({
                "uuid": "uuid-m",
                "host": "manual",
                "domain": "example.com",
                "ip": "7.7.7.7",
                "description": "printer"
            })),
        );

        let handler = Recorder::default();
        assert!(diff::apply(&desired, &current, &handler).await);
        assert_eq!(
            handler.ops.lock().unwrap().clone(),
            vec![
                "add:add.example.com",
                "set:uuid-u:2.2.2.2",
                "del:uuid-d",
                "reconfigure"
            ]
        );
    }
}
