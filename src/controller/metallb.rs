//! Derives one BGP neighbor on the appliance per cluster node, so the
//! appliance peers with every MetalLB speaker.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cluster::{self, Cluster},
    config::MetalLbConfig,
    diff::{self, DiffHandler},
    opnsense::{self, OpnsenseClient, Record},
};

/// Neighbors created by the controller are keyed (and described) with this
/// prefix; only such neighbors are ever deleted.
const KEY_PREFIX: &str = "kpc-";

#[derive(Debug, Error)]
pub enum Error {
    #[error("`bgp-implementation` is not set")]
    MissingBgpImplementation,

    #[error("unsupported BGP implementation `{0}`")]
    UnsupportedBgpImplementation(String),

    #[error("failed to list nodes: {0}")]
    ListNodes(#[source] cluster::Error),

    #[error("failed to search BGP neighbors: {0}")]
    SearchNeighbors(#[source] opnsense::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The appliance-side BGP daemon; selects the endpoint family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BgpImplementation {
    OpenBgp,
    Frr,
}

impl BgpImplementation {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "openbgp" => Ok(BgpImplementation::OpenBgp),
            "frr" => Ok(BgpImplementation::Frr),
            other => Err(Error::UnsupportedBgpImplementation(other.to_owned())),
        }
    }

    fn search_path(self) -> &'static str {
        match self {
            BgpImplementation::OpenBgp => "/api/openbgpd/settings/search_neighbor",
            BgpImplementation::Frr => "/api/frr/settings/search_bgp_neighbor",
        }
    }

    fn add_path(self) -> &'static str {
        match self {
            BgpImplementation::OpenBgp => "/api/openbgpd/settings/add_neighbor",
            BgpImplementation::Frr => "/api/frr/settings/add_bgp_neighbor",
        }
    }

    fn set_path(self, uuid: &str) -> String {
        match self {
            BgpImplementation::OpenBgp => {
                format!("/api/openbgpd/settings/set_neighbor/{}", uuid)
            }
            BgpImplementation::Frr => format!("/api/frr/settings/set_bgp_neighbor/{}", uuid),
        }
    }

    fn del_path(self, uuid: &str) -> String {
        match self {
            BgpImplementation::OpenBgp => {
                format!("/api/openbgpd/settings/del_neighbor/{}", uuid)
            }
            BgpImplementation::Frr => format!("/api/frr/settings/del_bgp_neighbor/{}", uuid),
        }
    }

    fn reload_path(self) -> &'static str {
        match self {
            BgpImplementation::OpenBgp => "/api/openbgpd/service/reload",
            BgpImplementation::Frr => "/api/frr/service/reload",
        }
    }
}

pub(super) struct MetalLbPlugin {
    cluster: Cluster,
    opnsense: OpnsenseClient,
    implementation: BgpImplementation,
    template: Record,
}

impl MetalLbPlugin {
    /// Fails on a missing or unknown `bgp-implementation`, which is a fatal
    /// configuration error at registration time.
    pub fn new(cluster: Cluster, opnsense: OpnsenseClient, config: &MetalLbConfig) -> Result<Self> {
        let raw = config
            .bgp_implementation
            .as_deref()
            .ok_or(Error::MissingBgpImplementation)?;
        let implementation = BgpImplementation::parse(raw)?;
        let template = config
            .options
            .get(raw)
            .map(|options| options.template.clone())
            .unwrap_or_default();
        Ok(Self {
            cluster,
            opnsense,
            implementation,
            template,
        })
    }

    #[tracing::instrument(name = "metallb", skip(self), level = "debug")]
    pub async fn reconcile(&self) -> Result<()> {
        debug!("reconciling BGP neighbors");
        let nodes = self.cluster.nodes().await.map_err(Error::ListNodes)?;
        let desired = desired_neighbors(&nodes, &self.template);

        let rows = self
            .opnsense
            .search_rows(self.implementation.search_path())
            .await
            .map_err(Error::SearchNeighbors)?;
        let current = current_neighbors(rows);

        let handler = NeighborHandler {
            opnsense: &self.opnsense,
            implementation: self.implementation,
        };
        diff::apply(&desired, &current, &handler).await;
        Ok(())
    }
}

fn desired_neighbors(nodes: &[Node], template: &Record) -> BTreeMap<String, Record> {
    let mut desired = BTreeMap::new();
    for node in nodes {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let address = match super::node_address(node) {
            Some(address) => address,
            None => {
                warn!("no usable address for node {}", name);
                continue;
            }
        };

        let key = format!("{}{}", KEY_PREFIX, address);
        let mut neighbor = template.clone();
        neighbor.insert("address".to_owned(), Value::String(address.to_owned()));
        neighbor.insert("description".to_owned(), Value::String(key.clone()));
        desired.insert(key, neighbor);
    }
    desired
}

// Neighbors are keyed by their description; rows without one are unmanaged.
fn current_neighbors(rows: Vec<Record>) -> BTreeMap<String, Record> {
    rows.into_iter()
        .filter_map(|row| {
            let key = row.get("description").and_then(Value::as_str)?.to_owned();
            Some((key, row))
        })
        .collect()
}

fn neighbor_equal(current: &Record, desired: &Record) -> bool {
    desired
        .iter()
        .all(|(key, value)| current.get(key) == Some(value))
}

fn neighbor_owned(current: &Record) -> bool {
    current
        .get("description")
        .and_then(Value::as_str)
        .map_or(false, |description| description.starts_with(KEY_PREFIX))
}

struct NeighborHandler<'a> {
    opnsense: &'a OpnsenseClient,
    implementation: BgpImplementation,
}

#[async_trait]
impl DiffHandler for NeighborHandler<'_> {
    fn equal(&self, current: &Record, desired: &Record) -> bool {
        neighbor_equal(current, desired)
    }

    fn owned(&self, current: &Record) -> bool {
        neighbor_owned(current)
    }

    async fn add(&self, key: &str, desired: &Record) -> opnsense::Result<()> {
        info!("adding BGP neighbor {}", key);
        self.opnsense
            .post(self.implementation.add_path(), Some(json!({ "neighbor": desired })))
            .await?;
        Ok(())
    }

    async fn update(&self, uuid: &str, desired: &Record) -> opnsense::Result<()> {
        info!("updating BGP neighbor {}", uuid);
        self.opnsense
            .post(
                &self.implementation.set_path(uuid),
                Some(json!({ "neighbor": desired })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> opnsense::Result<()> {
        info!("deleting BGP neighbor {}", uuid);
        self.opnsense
            .post(&self.implementation.del_path(uuid), None)
            .await?;
        Ok(())
    }

    async fn on_change(&self) -> opnsense::Result<()> {
        info!("reloading BGP service");
        self.opnsense
            .post(self.implementation.reload_path(), None)
            .await?;
        Ok(())
    }
}
