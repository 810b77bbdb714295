//! Shared plumbing for the Unbound DNS plugins: the host-override handler
//! used by both DNS plugins, plus the ownership marker and commit path the
//! host-alias plugin reuses.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    diff::DiffHandler,
    opnsense::{self, OpnsenseClient, Record},
};

/// Records created by the controller carry a description starting with
/// this marker; everything else on the appliance is left alone.
pub(super) const OWNED_PREFIX: &str = "Managed by K8s ";

pub(super) const RECONFIGURE_PATH: &str = "/api/unbound/service/reconfigure";

const SEARCH_PATH: &str = "/api/unbound/settings/search_host_override";
const ADD_PATH: &str = "/api/unbound/settings/add_host_override";

pub(super) fn owned(current: &Record) -> bool {
    current
        .get("description")
        .and_then(Value::as_str)
        .map_or(false, |description| description.starts_with(OWNED_PREFIX))
}

/// Split an FQDN into the leftmost label and the remaining domain.
/// Names with fewer than two labels have no place in the appliance's
/// host/domain model.
pub(super) fn split_fqdn(hostname: &str) -> Option<(&str, &str)> {
    let (host, domain) = hostname.split_once('.')?;
    if host.is_empty() || domain.is_empty() {
        return None;
    }
    Some((host, domain))
}

pub(super) fn host_override(host: &str, domain: &str, ip: &str, description: String) -> Record {
    let mut record = Record::new();
    record.insert("host".to_owned(), Value::String(host.to_owned()));
    record.insert("domain".to_owned(), Value::String(domain.to_owned()));
    record.insert("ip".to_owned(), Value::String(ip.to_owned()));
    record.insert("description".to_owned(), Value::String(description));
    record
}

/// Current overrides keyed the same way desired ones are: `<host>.<domain>`.
pub(super) async fn current_host_overrides(
    opnsense: &OpnsenseClient,
) -> opnsense::Result<BTreeMap<String, Record>> {
    let rows = opnsense.search_rows(SEARCH_PATH).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let host = row.get("host").and_then(Value::as_str)?;
            let domain = row.get("domain").and_then(Value::as_str)?;
            let key = format!("{}.{}", host, domain);
            Some((key, row))
        })
        .collect())
}

/// Host overrides converge on the `ip` field only; other fields are the
/// appliance's business once the record exists.
pub(super) struct HostOverrides<'a> {
    pub opnsense: &'a OpnsenseClient,
}

#[async_trait]
impl DiffHandler for HostOverrides<'_> {
    fn equal(&self, current: &Record, desired: &Record) -> bool {
        current.get("ip") == desired.get("ip")
    }

    fn owned(&self, current: &Record) -> bool {
        owned(current)
    }

    async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()> {
        info!("adding host override {}", key);
        self.opnsense
            .post(ADD_PATH, Some(json!({ "host": desired })))
            .await?;
        Ok(())
    }

    async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
        info!("updating host override {}", uuid);
        self.opnsense
            .post(
                &format!("/api/unbound/settings/set_host_override/{}", uuid),
                Some(json!({ "host": desired })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
        info!("deleting host override {}", uuid);
        self.opnsense
            .post(
                &format!("/api/unbound/settings/del_host_override/{}", uuid),
                None,
            )
            .await?;
        Ok(())
    }

    async fn on_change(&self) -> opnsense::Result<()> {
        info!("reconfiguring Unbound service");
        self.opnsense.post(RECONFIGURE_PATH, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{super::test_util::record, *};

    #[test]
    fn fqdn_split_takes_the_leftmost_label() {
        assert_eq!(split_fqdn("web.example.com"), Some(("web", "example.com")));
        assert_eq!(split_fqdn("a.b"), Some(("a", "b")));
        assert_eq!(split_fqdn("x"), None);
        assert_eq!(split_fqdn("x."), None);
        assert_eq!(split_fqdn(".example.com"), None);
        assert_eq!(split_fqdn(""), None);
    }

    #[test]
    fn ownership_is_marked_by_the_description() {
        assert!(owned(&record(
            json!({"description": "Managed by K8s Service default/web"})
        )));
        assert!(owned(&record(
            json!({"description": "Managed by K8s Ingress default/web"})
        )));
        assert!(!owned(&record(json!({"description": "hand crafted"}))));
        assert!(!owned(&Record::new()));
    }

    #[test]
    fn override_records_compare_on_ip_only() {
        let client = OpnsenseClient::new("https://fw", "k", "s", false).unwrap();
        let handler = HostOverrides { opnsense: &client };
        let current = record(json!({
            "uuid": "uuid-1",
            "host": "web",
            "domain": "example.com",
            "ip": "1.1.1.1",
            "description": "Managed by K8s Service default/web"
        }));
        let same = host_override("web", "example.com", "1.1.1.1", "other".to_owned());
        let changed = host_override("web", "example.com", "2.2.2.2", "other".to_owned());
        assert!(handler.equal(&current, &same));
        assert!(!handler.equal(&current, &changed));
    }
}
