//! kubeauto kubehub: discovery, list/watch and pod notification wiring

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{reflector, watcher, WatchStreamExt},
    Client,
};
use kubeauto_core::{Snapshot, WatchEvent, WatchEventKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod streams;

pub use streams::{start_status_streams, WatchScope};

/// Boxed, owned stream of fallible items handed out by a [`ResourceWatch`].
pub type EventStream<T> = BoxStream<'static, Result<T>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Resource name used in URLs and output lines, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    /// Verbs advertised by discovery (`list`, `watch`, ...).
    pub verbs: Vec<String>,
}

impl ResourceKind {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn watchable(&self) -> bool {
        self.verbs.iter().any(|v| v == "watch")
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Result of a list call: the items plus the cursor to start watching from.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub resource_version: String,
    pub items: Vec<Snapshot>,
}

/// Source of resource state: discovery, list+watch per kind, and pod add/update notifications.
#[async_trait::async_trait]
pub trait ResourceWatch: Send + Sync {
    /// Namespaced kinds served in `group` (empty = core group), watchable or not.
    async fn discover(&self, group: &str) -> Result<Vec<ResourceKind>>;

    async fn list(&self, kind: &ResourceKind, namespace: &str, selector: &str) -> Result<Listing>;

    /// Watch `kind` starting after `from_version`. The stream ends or errors when the watch breaks.
    async fn watch(&self, kind: &ResourceKind, namespace: &str, selector: &str, from_version: &str) -> Result<EventStream<WatchEvent>>;

    /// Pods that were added or updated, including periodic re-deliveries of known pods.
    async fn pod_events(&self, namespace: &str, selector: &str) -> Result<EventStream<Pod>>;
}

/// [`ResourceWatch`] backed by a kube client.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    resync: Duration,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, resync: Duration::from_secs(5) }
    }

    /// Interval at which every known pod is re-delivered on the pod feed.
    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    fn dynamic_api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn snapshot_from(obj: &DynamicObject, kind: &ResourceKind) -> Result<Snapshot> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Snapshot::new(raw).with_type_meta(&kind.api_version(), &kind.kind))
}

fn event_from(ev: kube::Result<KubeWatchEvent<DynamicObject>>, kind: &ResourceKind) -> Option<Result<WatchEvent>> {
    let (event_kind, obj) = match ev {
        Ok(KubeWatchEvent::Added(o)) => (WatchEventKind::Added, o),
        Ok(KubeWatchEvent::Modified(o)) => (WatchEventKind::Modified, o),
        Ok(KubeWatchEvent::Deleted(o)) => (WatchEventKind::Deleted, o),
        Ok(KubeWatchEvent::Bookmark(_)) => return None,
        Ok(KubeWatchEvent::Error(e)) => return Some(Err(anyhow!("watch error {}: {}", e.code, e.message))),
        Err(e) => return Some(Err(anyhow::Error::from(e).context("watch stream"))),
    };
    Some(snapshot_from(&obj, kind).map(|snapshot| WatchEvent { kind: event_kind, snapshot }))
}

/// Re-emit every stored pod on each tick, after the first.
fn resync_stream(store: reflector::Store<Pod>, period: Duration) -> impl Stream<Item = Result<Pod>> + Send + 'static {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    futures::stream::unfold(ticker, |mut ticker| async move {
        ticker.tick().await;
        Some(((), ticker))
    })
    .skip(1)
    .flat_map(move |()| {
        let pods = store.state();
        debug!(count = pods.len(), "pod resync");
        futures::stream::iter(pods.into_iter().map(|p| Ok(Pod::clone(&p))))
    })
}

#[async_trait::async_trait]
impl ResourceWatch for KubeHub {
    async fn discover(&self, group: &str) -> Result<Vec<ResourceKind>> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await
            .context("running API discovery")?;
        let mut out = Vec::new();
        for g in discovery.groups().filter(|g| g.name() == group) {
            for (ar, caps) in g.recommended_resources() {
                out.push(ResourceKind {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    verbs: caps.operations.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.version.cmp(&b.version).then(a.kind.cmp(&b.kind)));
        info!(group = %group, kinds = out.len(), "discovery complete");
        Ok(out)
    }

    async fn list(&self, kind: &ResourceKind, namespace: &str, selector: &str) -> Result<Listing> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        let list = self
            .dynamic_api(kind, namespace)
            .list(&lp)
            .await
            .with_context(|| format!("listing {} in {}", kind.gvk_key(), namespace))?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list.items.iter().map(|o| snapshot_from(o, kind)).collect::<Result<Vec<_>>>()?;
        Ok(Listing { resource_version, items })
    }

    async fn watch(&self, kind: &ResourceKind, namespace: &str, selector: &str, from_version: &str) -> Result<EventStream<WatchEvent>> {
        let mut wp = WatchParams::default();
        if !selector.is_empty() {
            wp = wp.labels(selector);
        }
        let stream = self
            .dynamic_api(kind, namespace)
            .watch(&wp, from_version)
            .await
            .with_context(|| format!("watching {} in {}", kind.gvk_key(), namespace))?;
        let kind = kind.clone();
        Ok(stream.filter_map(move |ev| futures::future::ready(event_from(ev, &kind))).boxed())
    }

    async fn pod_events(&self, namespace: &str, selector: &str) -> Result<EventStream<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut cfg = watcher::Config::default();
        if !selector.is_empty() {
            cfg = cfg.labels(selector);
        }
        let (store, writer) = reflector::store();
        let applied = reflector(writer, watcher(api, cfg).default_backoff())
            .applied_objects()
            .map_err(|e| anyhow::Error::from(e).context("pod watcher"));
        info!(ns = %namespace, selector = %selector, resync = ?self.resync, "pod feed started");
        Ok(futures::stream::select(applied, resync_stream(store, self.resync)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(group: &str, verbs: &[&str]) -> ResourceKind {
        ResourceKind {
            group: group.to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            plural: "deployments".to_string(),
            namespaced: true,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn keys_and_api_version() {
        assert_eq!(kind("", &[]).gvk_key(), "v1/Deployment");
        assert_eq!(kind("apps", &[]).gvk_key(), "apps/v1/Deployment");
        assert_eq!(kind("", &[]).api_version(), "v1");
        assert_eq!(kind("apps", &[]).api_version(), "apps/v1");
        assert_eq!(kind("apps", &[]).api_resource().plural, "deployments");
    }

    #[test]
    fn watchable_requires_watch_verb() {
        assert!(kind("apps", &["get", "list", "watch"]).watchable());
        assert!(!kind("apps", &["get", "list"]).watchable());
    }

    #[test]
    fn snapshot_strips_managed_fields_and_fills_type_meta() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "ns", "managedFields": [{"manager": "kubectl"}]},
            "spec": {"replicas": 1}
        }))
        .expect("dynamic object");
        let snap = snapshot_from(&obj, &kind("apps", &["watch"])).expect("snapshot");
        assert_eq!(snap.api_version(), "apps/v1");
        assert_eq!(snap.kind(), "Deployment");
        assert_eq!(snap.key(), "ns/web");
        assert!(snap.raw().pointer("/metadata/managedFields").is_none());
    }

    #[test]
    fn bookmarks_are_dropped_and_errors_surface() {
        let k = kind("apps", &["watch"]);
        let added: DynamicObject = serde_json::from_value(serde_json::json!({"metadata": {"name": "a"}})).expect("obj");
        let ev = event_from(Ok(KubeWatchEvent::Added(added)), &k).expect("some").expect("ok");
        assert_eq!(ev.kind, WatchEventKind::Added);
        assert_eq!(ev.snapshot.name(), "a");

        let err = kube::core::ErrorResponse { status: "Failure".into(), message: "too old".into(), reason: "Expired".into(), code: 410 };
        assert!(event_from(Ok(KubeWatchEvent::Error(err)), &k).expect("some").is_err());
    }
}
