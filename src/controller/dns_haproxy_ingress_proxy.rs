//! Publishes DNS aliases for proxied ingress hosts: each host resolves to
//! the hostname of the HAProxy frontend that serves it.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    cluster::{self, Cluster},
    config::{DnsHaproxyIngressProxyConfig, FrontendConfig, HaproxyIngressProxyConfig},
    diff::{self, DiffHandler},
    opnsense::{self, OpnsenseClient, Record},
};

use super::unbound;

/// Annotation selecting the HAProxy frontend an ingress is proxied by.
pub(super) const FRONTEND_ANNOTATION: &str = "haproxy-ingress-proxy.opnsense.org/frontend";

const SEARCH_PATH: &str = "/api/unbound/settings/search_host_alias";
const ADD_PATH: &str = "/api/unbound/settings/add_host_alias";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list ingresses: {0}")]
    ListIngresses(#[source] cluster::Error),

    #[error("failed to search host aliases: {0}")]
    SearchAliases(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(super) struct DnsHaproxyIngressProxyPlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
    frontends: BTreeMap<String, FrontendConfig>,
    default_frontend: Option<String>,
}

impl DnsHaproxyIngressProxyPlugin {
    pub fn new(
        cluster: Cluster,
        opnsense: OpnsenseClient,
        config: DnsHaproxyIngressProxyConfig,
        proxy_config: &HaproxyIngressProxyConfig,
    ) -> Self {
        Self {
            cluster,
            opnsense,
            frontends: config.frontends,
            default_frontend: proxy_config.default_frontend.clone(),
        }
    }

    #[tracing::instrument(name = "dns_haproxy_ingress_proxy", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling host aliases for proxied ingresses");
        let ingresses = self
            .cluster
            .ingresses()
            .await
            .map_err(Error::ListIngresses)?;
        let desired =
            desired_aliases(&ingresses, &self.frontends, self.default_frontend.as_deref());

        let current = current_aliases(&self.opnsense)
            .await
            .map_err(Error::SearchAliases)?;

        let handler = HostAliases {
            opnsense: &self.opnsense,
        };
        diff::apply(&desired, &current, &handler).await;
        Ok(())
    }
}

fn desired_aliases(
    ingresses: &[Ingress],
    frontends: &BTreeMap<String, FrontendConfig>,
    default_frontend: Option<&str>,
) -> BTreeMap<String, Record> {
    let mut desired = BTreeMap::new();
    for ingress in ingresses {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
        let name = ingress.metadata.name.as_deref().unwrap_or_default();

        let frontend = match ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(FRONTEND_ANNOTATION))
            .map(String::as_str)
            .or(default_frontend)
        {
            Some(frontend) => frontend,
            None => continue,
        };
        // Ingresses proxied by an unconfigured frontend get no alias.
        let target = match frontends
            .get(frontend)
            .and_then(|config| config.hostname.as_deref())
        {
            Some(target) => target,
            None => {
                debug!(
                    "frontend `{}` for ingress {}/{} is not configured, skipping",
                    frontend, namespace, name
                );
                continue;
            }
        };

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_deref())
            .unwrap_or_default();
        for rule in rules {
            let host = match rule.host.as_deref() {
                Some(host) if !host.is_empty() => host,
                _ => continue,
            };
            let mut alias = Record::new();
            alias.insert("host".to_owned(), Value::String(host.to_owned()));
            alias.insert("target".to_owned(), Value::String(target.to_owned()));
            alias.insert(
                "description".to_owned(),
                Value::String(format!("Managed by K8s Ingress {}/{}", namespace, name)),
            );
            desired.insert(host.to_owned(), alias);
        }
    }
    desired
}

// The appliance reports the alias name in its `hostname` field.
async fn current_aliases(
    opnsense: &OpnsenseClient,
) -> opnsense::Result<BTreeMap<String, Record>> {
    let rows = opnsense.search_rows(SEARCH_PATH).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let hostname = row.get("hostname").and_then(Value::as_str)?.to_owned();
            Some((hostname, row))
        })
        .collect())
}

/// Aliases converge on the `target` field only.
struct HostAliases<'a> {
    opnsense: &'a OpnsenseClient,
}

#[async_trait]
impl DiffHandler for HostAliases<'_> {
    fn equal(&self, current: &Record, desired: &Record) -> bool {
        current.get("target") == desired.get("target")
    }

    fn owned(&self, current: &Record) -> bool {
        unbound::owned(current)
    }

    async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()> {
        info!("adding host alias {}", key);
        self.opnsense
            .post(ADD_PATH, Some(json!({ "alias": desired })))
            .await?;
        Ok(())
    }

    async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
        info!("updating host alias {}", uuid);
        self.opnsense
            .post(
                &format!("/api/unbound/settings/set_host_alias/{}", uuid),
                Some(json!({ "alias": desired })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
        info!("deleting host alias {}", uuid);
        self.opnsense
            .post(
                &format!("/api/unbound/settings/del_host_alias/{}", uuid),
                None,
            )
            .await?;
        Ok(())
    }

    async fn on_change(&self) -> opnsense::Result<()> {
        info!("reconfiguring Unbound service");
        self.opnsense.post(unbound::RECONFIGURE_PATH, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::{
        super::test_util::{ingress, record},
        *,
    };

    fn frontends() -> BTreeMap<String, FrontendConfig> {
        vec![
            (
                "http-80".to_owned(),
                FrontendConfig {
                    hostname: Some("http-80.k8s".to_owned()),
                },
            ),
            (
                "http-443".to_owned(),
                FrontendConfig {
                    hostname: Some("https-443.k8s".to_owned()),
                },
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn frontend_selection_prefers_the_annotation() {
        let ingresses = vec![
            ingress("add", &["add.example.com"], Some("1.1.1.1"), None),
            ingress(
                "update",
                &["update.example.com"],
                Some("1.1.1.1"),
                Some("http-443"),
            ),
            ingress(
                "ignore",
                &["ignore.example.com"],
                Some("1.1.1.1"),
                Some("tcp-9000"),
            ),
        ];
        let desired = desired_aliases(&ingresses, &frontends(), Some("http-80"));

        assert_eq!(
            desired.keys().collect::<Vec<_>>(),
            vec!["add.example.com", "update.example.com"]
        );
        assert_eq!(desired["add.example.com"]["target"], json!("http-80.k8s"));
        assert_eq!(
            desired["update.example.com"]["target"],
            json!("https-443.k8s")
        );
        assert_eq!(
            desired["add.example.com"]["description"],
            json!("Managed by K8s Ingress default/add")
        );
    }

    #[test]
    fn no_default_frontend_skips_unannotated_ingresses() {
        let ingresses = vec![ingress("web", &["app.example.com"], Some("1.1.1.1"), None)];
        assert!(desired_aliases(&ingresses, &frontends(), None).is_empty());
    }

    #[test]
    fn frontends_without_hostname_are_not_usable() {
        let mut frontends = frontends();
        frontends.insert("bare".to_owned(), FrontendConfig { hostname: None });
        let ingresses = vec![ingress(
            "web",
            &["app.example.com"],
            Some("1.1.1.1"),
            Some("bare"),
        )];
        assert!(desired_aliases(&ingresses, &frontends, None).is_empty());
    }

    #[test]
    fn alias_equality_is_on_the_target() {
        let client = OpnsenseClient::new("https://fw", "k", "s", false).unwrap();
        let handler = HostAliases { opnsense: &client };
        let current = record(json!({
            "uuid": "uuid-1",
            "hostname": "update.example.com",
            "target": "old.target.k8s",
            "description": "Managed by K8s Ingress default/update"
        }));
        let same = record(json!({"host": "update.example.com", "target": "old.target.k8s"}));
        let changed = record(json!({"host": "update.example.com", "target": "https-443.k8s"}));
        assert!(handler.equal(&current, &same));
        assert!(!handler.equal(&current, &changed));
    }

    // S4: add with the default frontend's hostname, retarget the annotated
    // one, delete the orphan, and ignore the unconfigured frontend.
    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiffHandler for Recorder {
        fn equal(&self, current: &Record, desired: &Record) -> bool {
            current.get("target") == desired.get("target")
        }

        fn owned(&self, current: &Record) -> bool {
            unbound::owned(current)
        }

        async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()> {
            let target = desired
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.ops
                .lock()
                .unwrap()
                .push(format!("add:{}:{}", key, target));
            Ok(())
        }

        async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
            let target = desired
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.ops
                .lock()
                .unwrap()
                .push(format!("set:{}:{}", uuid, target));
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
    async fn converges_aliases_for_the_selected_frontends() {
        let ingresses = vec![
            ingress("add", &["add.example.com"], Some("1.1.1.1"), None),
            ingress(
                "update",
                &["update.example.com"],
                Some("1.1.1.1"),
                Some("http-443"),
            ),
            ingress(
                "ignore",
                &["ignore.example.com"],
                Some("1.1.1.1"),
                Some("tcp-9000"),
            ),
        ];
        let desired = desired_aliases(&ingresses, &frontends(), Some("http-80"));

        let mut current = BTreeMap::new();
        current.insert(
            "update.example.com".to_owned(),
            record(json!({
                "uuid": "uuid-u",
                "hostname": "update.example.com",
                "target": "old.target.k8s",
                "description": "Managed by K8s Ingress default/update"
            })),
        );
        current.insert(
            "delete.example.com".to_owned(),
            record(json!({
                "uuid": "uuid-d",
                "hostname": "delete.example.com",
                "target": "http-80.k8s",
                "description": "Managed by K8s Ingress other/gone"
            })),
        );

        let handler = Recorder::default();
        assert!(diff::apply(&desired, &current, &handler).await);
        assert_eq!(
            handler.ops.lock().unwrap().clone(),
            vec![
                "add:add.example.com:http-80.k8s",
                "set:uuid-u:https-443.k8s",
                "del:uuid-d",
                "reconfigure"
            ]
        );
    }
}
