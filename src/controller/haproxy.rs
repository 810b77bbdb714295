//! Shared plumbing for the HAProxy plugins. Every HAProxy object kind is
//! driven through the same snake_case settings routes and keyed by `name`,
//! so one handler covers ACLs, actions, backends and frontends.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    diff::DiffHandler,
    opnsense::{self, OpnsenseClient, Record},
};

pub(super) const RECONFIGURE_PATH: &str = "/api/haproxy/service/reconfigure";

fn search_path(kind: &str) -> String {
    format!("/api/haproxy/settings/search_{}", kind)
}

/// Current objects of `kind`, keyed by their `name` field.
pub(super) async fn current_items(
    opnsense: &OpnsenseClient,
    kind: &str,
) -> opnsense::Result<BTreeMap<String, Record>> {
    let rows = opnsense.search_rows(&search_path(kind)).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let name = row.get("name").and_then(Value::as_str)?.to_owned();
            Some((name, row))
        })
        .collect())
}

/// Apply staged HAProxy changes. Called once per pass after all diffs, so
/// mutating several kinds still commits a single time. Failures are logged;
/// the next pass converges the appliance again.
pub(super) async fn reconfigure(opnsense: &OpnsenseClient) {
    info!("reconfiguring HAProxy service");
    if let Err(err) = opnsense.post(RECONFIGURE_PATH, None).await {
        warn!("failed to reconfigure HAProxy service: {}", err);
    }
}

/// Diff handler over one HAProxy object kind.
///
/// No field equality is defined for these kinds; existing desired keys are
/// always written. `owned_prefix` of `None` treats every current entry as
/// managed (the declarative plugin owns the whole table).
pub(super) struct Items<'a> {
    pub opnsense: &'a OpnsenseClient,
    pub kind: &'static str,
    pub owned_prefix: Option<&'static str>,
}

#[async_trait]
impl DiffHandler for Items<'_> {
    fn equal(&self, _current: &Record, _desired: &Record) -> bool {
        false
    }

    fn owned(&self, current: &Record) -> bool {
        match self.owned_prefix {
            Some(prefix) => current
                .get("name")
                .and_then(Value::as_str)
                .map_or(false, |name| name.starts_with(prefix)),
            None => true,
        }
    }

    async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()> {
        info!("adding {} {}", self.kind, key);
        self.opnsense
            .post(
                &format!("/api/haproxy/settings/add_{}", self.kind),
                Some(json!({ (self.kind): desired })),
            )
            .await?;
        Ok(())
    }

    async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
        info!("updating {} {}", self.kind, uuid);
        self.opnsense
            .post(
                &format!("/api/haproxy/settings/set_{}/{}", self.kind, uuid),
                Some(json!({ (self.kind): desired })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
        info!("deleting {} {}", self.kind, uuid);
        self.opnsense
            .post(
                &format!("/api/haproxy/settings/del_{}/{}", self.kind, uuid),
                None,
            )
            .await?;
        Ok(())
    }
}
