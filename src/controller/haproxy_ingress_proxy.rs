//! Routes ingress hosts through an HAProxy frontend on the appliance: one
//! host-match ACL and one backend-selecting action per ingress rule host.
use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cluster::{self, Cluster},
    config::HaproxyIngressProxyConfig,
    diff,
    opnsense::{self, OpnsenseClient, Record},
};

use super::haproxy;

/// ACLs and actions created by the controller share this name prefix; only
/// such entries are ever deleted.
const KEY_PREFIX: &str = "kic-";

// The appliance-side condition that matches a request's Host header.
const ACL_EXPRESSION: &str = "host_matches";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list ingresses: {0}")]
    ListIngresses(#[source] cluster::Error),

    #[error("failed to search ACLs: {0}")]
    SearchAcls(#[source] opnsense::Error),

    #[error("failed to search actions: {0}")]
    SearchActions(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(super) struct HaproxyIngressProxyPlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
    default_backend: Option<String>,
}

/// An action before its ACL references are resolved. Actions link to ACLs
/// by appliance UUID, which is only known after the ACL diff has run.
struct PendingAction {
    record: Record,
    acl_names: Vec<String>,
}

impl HaproxyIngressProxyPlugin {
    pub fn new(
        cluster: Cluster,
        opnsense: OpnsenseClient,
        config: HaproxyIngressProxyConfig,
    ) -> Self {
        Self {
            cluster,
            opnsense,
            default_backend: config.default_backend,
        }
    }

    #[tracing::instrument(name = "haproxy_ingress_proxy", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling HAProxy ACLs and actions");
        let ingresses = self
            .cluster
            .ingresses()
            .await
            .map_err(Error::ListIngresses)?;
        let (desired_acls, desired_actions) =
            desired_state(&ingresses, self.default_backend.as_deref());

        let current_acls = haproxy::current_items(&self.opnsense, "acl")
            .await
            .map_err(Error::SearchAcls)?;
        let current_actions = haproxy::current_items(&self.opnsense, "action")
            .await
            .map_err(Error::SearchActions)?;

        let acl_handler = haproxy::Items {
            opnsense: &self.opnsense,
            kind: "acl",
            owned_prefix: Some(KEY_PREFIX),
        };
        let acls_changed = diff::apply(&desired_acls, &current_acls, &acl_handler).await;

        // Re-list so actions can reference the UUIDs of just-created ACLs.
        let refreshed_acls = haproxy::current_items(&self.opnsense, "acl")
            .await
            .map_err(Error::SearchAcls)?;
        let linked_actions = link_actions(desired_actions, &refreshed_acls);

        let action_handler = haproxy::Items {
            opnsense: &self.opnsense,
            kind: "action",
            owned_prefix: Some(KEY_PREFIX),
        };
        let actions_changed = diff::apply(&linked_actions, &current_actions, &action_handler).await;

        if acls_changed || actions_changed {
            haproxy::reconfigure(&self.opnsense).await;
        }
        Ok(())
    }
}

fn desired_state(
    ingresses: &[Ingress],
    default_backend: Option<&str>,
) -> (BTreeMap<String, Record>, BTreeMap<String, PendingAction>) {
    let mut acls = BTreeMap::new();
    let mut actions = BTreeMap::new();

    for ingress in ingresses {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
        let name = ingress.metadata.name.as_deref().unwrap_or_default();

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
            let key = format!("{}{}", KEY_PREFIX, host);

            let mut acl = Record::new();
            acl.insert("name".to_owned(), Value::String(key.clone()));
            acl.insert(
                "expression".to_owned(),
                Value::String(ACL_EXPRESSION.to_owned()),
            );
            acl.insert("value".to_owned(), Value::String(host.to_owned()));
            acl.insert(
                "description".to_owned(),
                Value::String(format!("Managed by K8s Ingress {}/{}", namespace, name)),
            );
            acls.insert(key.clone(), acl);

            let mut action = Record::new();
            action.insert("name".to_owned(), Value::String(key.clone()));
            action.insert("test_type".to_owned(), Value::String("if".to_owned()));
            action.insert("operator".to_owned(), Value::String("and".to_owned()));
            if let Some(backend) = default_backend {
                action.insert("backend".to_owned(), Value::String(backend.to_owned()));
            }
            actions.insert(
                key.clone(),
                PendingAction {
                    record: action,
                    acl_names: vec![key],
                },
            );
        }
    }
    (acls, actions)
}

/// Resolve each pending action's ACL names against the current appliance
/// rows. Actions whose ACLs cannot be resolved are dropped from the desired
/// set for this pass.
fn link_actions(
    pending: BTreeMap<String, PendingAction>,
    acls: &BTreeMap<String, Record>,
) -> BTreeMap<String, Record> {
    let mut linked = BTreeMap::new();
    for (name, action) in pending {
        let uuids = action
            .acl_names
            .iter()
            .filter_map(|acl_name| {
                acls.get(acl_name)
                    .and_then(|row| row.get("uuid"))
                    .and_then(Value::as_str)
            })
            .collect::<Vec<_>>();
        if uuids.is_empty() {
            warn!("could not resolve ACL uuids for action {}, skipping", name);
            continue;
        }

        let mut record = action.record;
        record.insert("acls".to_owned(), Value::String(uuids.join(",")));
        linked.insert(name, record);
    }
    linked
}
