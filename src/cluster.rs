//! Cluster-side observations: full snapshots via `list`, plus restartable
//! watch streams used only as reconcile triggers.
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Node, Service},
    networking::v1::Ingress,
};
use kube::{
    api::ListParams,
    error::ErrorResponse,
    runtime::watcher,
    Api, Client, Resource,
};
use thiserror::Error;

/// Label marking a ConfigMap as a declarative HAProxy document.
pub const DECLARATIVE_LABEL: &str = "pfsense.org/type=declarative";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list {kind}: {source}")]
    List {
        kind: &'static str,
        source: kube::Error,
    },

    #[error("failed to get service {namespace}/{name}: {source}")]
    GetService {
        namespace: String,
        name: String,
        source: kube::Error,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The resource kinds plugins can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchKind {
    Node,
    Service,
    Ingress,
    ConfigMap,
}

impl WatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchKind::Node => "node",
            WatchKind::Service => "service",
            WatchKind::Ingress => "ingress",
            WatchKind::ConfigMap => "configmap",
        }
    }
}

/// Cheap to clone handle to the cluster API.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
}

impl Cluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        list(Api::all(self.client.clone()), ListParams::default(), "nodes").await
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        list(
            Api::all(self.client.clone()),
            ListParams::default(),
            "services",
        )
        .await
    }

    pub async fn ingresses(&self) -> Result<Vec<Ingress>> {
        list(
            Api::all(self.client.clone()),
            ListParams::default(),
            "ingresses",
        )
        .await
    }

    /// ConfigMaps labelled as declarative HAProxy documents.
    pub async fn declarative_config_maps(&self) -> Result<Vec<ConfigMap>> {
        list(
            Api::all(self.client.clone()),
            ListParams::default().labels(DECLARATIVE_LABEL),
            "declarative configmaps",
        )
        .await
    }

    /// Point lookup used by declarative backend resolution; 404 is absence.
    pub async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(service) => Ok(Some(service)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(source) => Err(Error::GetService {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                source,
            }),
        }
    }

    /// An infinite trigger stream for `kind`. The underlying watch is
    /// re-established transparently on disconnection; payloads are dropped
    /// because reconciles take fresh snapshots. Error items are surfaced so
    /// the dispatcher can log them.
    pub fn events(&self, kind: WatchKind) -> BoxStream<'static, watcher::Result<()>> {
        let client = self.client.clone();
        match kind {
            WatchKind::Node => trigger_stream::<Node>(Api::all(client)),
            WatchKind::Service => trigger_stream::<Service>(Api::all(client)),
            WatchKind::Ingress => trigger_stream::<Ingress>(Api::all(client)),
            WatchKind::ConfigMap => trigger_stream::<ConfigMap>(Api::all(client)),
        }
    }

}

async fn list<K>(api: Api<K>, lp: ListParams, kind: &'static str) -> Result<Vec<K>>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let list = api
        .list(&lp)
        .await
        .map_err(|source| Error::List { kind, source })?;
    Ok(list.items)
}

fn trigger_stream<K>(api: Api<K>) -> BoxStream<'static, watcher::Result<()>>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    watcher(api, ListParams::default()).map_ok(|_| ()).boxed()
}
