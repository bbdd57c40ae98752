//! Container view of a pod: which containers run, which ports they declare,
//! and which of them the supervisor should attach to.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};

/// Annotation naming the container `kubectl logs` picks by default.
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerView {
    pub name: String,
    pub running: bool,
    pub ports: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodView {
    pub name: String,
    pub namespace: String,
    /// Init containers first, then regular containers, in spec order.
    pub containers: Vec<ContainerView>,
    pub default_container: Option<String>,
}

/// Which containers of a pod get a log tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContainerFilter {
    /// The pod's default-container annotation when present, otherwise every container.
    #[default]
    Auto,
    All,
    Named(String),
}

impl ContainerFilter {
    /// `all` wins over a container name; neither means [`ContainerFilter::Auto`].
    pub fn from_flags(container: Option<String>, all: bool) -> Self {
        match (all, container) {
            (true, _) => ContainerFilter::All,
            (false, Some(name)) if !name.is_empty() => ContainerFilter::Named(name),
            _ => ContainerFilter::Auto,
        }
    }

    /// The single container to keep, or `None` for all of them.
    fn select<'a>(&'a self, view: &'a PodView) -> Option<&'a str> {
        match self {
            ContainerFilter::All => None,
            ContainerFilter::Named(name) => Some(name.as_str()),
            ContainerFilter::Auto => view.default_container.as_deref().filter(|c| !c.is_empty()),
        }
    }
}

fn running_names(statuses: Option<&Vec<ContainerStatus>>) -> impl Iterator<Item = &str> {
    statuses
        .into_iter()
        .flatten()
        .filter(|s| s.state.as_ref().is_some_and(|st| st.running.is_some()))
        .map(|s| s.name.as_str())
}

fn container_view(c: &Container, running: &HashSet<&str>) -> ContainerView {
    ContainerView {
        name: c.name.clone(),
        running: running.contains(c.name.as_str()),
        ports: c.ports.iter().flatten().map(|p| p.container_port).collect(),
    }
}

impl PodView {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let running: HashSet<&str> = running_names(status.and_then(|s| s.init_container_statuses.as_ref()))
            .chain(running_names(status.and_then(|s| s.container_statuses.as_ref())))
            .collect();
        let containers = pod
            .spec
            .iter()
            .flat_map(|spec| spec.init_containers.iter().flatten().chain(spec.containers.iter()))
            .map(|c| container_view(c, &running))
            .collect();
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            containers,
            default_container: pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(DEFAULT_CONTAINER_ANNOTATION))
                .cloned(),
        }
    }

    /// Running containers that pass `filter`.
    pub fn targets<'a>(&'a self, filter: &'a ContainerFilter) -> impl Iterator<Item = &'a ContainerView> + 'a {
        let only = filter.select(self);
        self.containers
            .iter()
            .filter(move |c| c.running && only.map_or(true, |name| c.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(annotations: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "web-0", "namespace": "shop", "annotations": annotations},
            "spec": {
                "initContainers": [{"name": "migrate"}],
                "containers": [
                    {"name": "app", "ports": [{"containerPort": 8080}, {"containerPort": 9090}]},
                    {"name": "sidecar"},
                    {"name": "idle"}
                ]
            },
            "status": {
                "initContainerStatuses": [
                    {"name": "migrate", "image": "m", "imageID": "", "ready": false, "restartCount": 0,
                     "state": {"terminated": {"exitCode": 0}}}
                ],
                "containerStatuses": [
                    {"name": "app", "image": "a", "imageID": "", "ready": true, "restartCount": 0,
                     "state": {"running": {}}},
                    {"name": "sidecar", "image": "s", "imageID": "", "ready": true, "restartCount": 0,
                     "state": {"running": {}}},
                    {"name": "idle", "image": "i", "imageID": "", "ready": false, "restartCount": 0,
                     "state": {"waiting": {"reason": "ContainerCreating"}}}
                ]
            }
        }))
        .expect("pod fixture")
    }

    fn names<'a>(it: impl Iterator<Item = &'a ContainerView>) -> Vec<&'a str> {
        it.map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn view_orders_init_first_and_marks_running() {
        let view = PodView::from_pod(&pod(json!({})));
        assert_eq!(view.name, "web-0");
        assert_eq!(view.namespace, "shop");
        assert_eq!(names(view.containers.iter()), vec!["migrate", "app", "sidecar", "idle"]);
        assert_eq!(view.containers.iter().filter(|c| c.running).count(), 2);
        assert_eq!(view.containers[1].ports, vec![8080, 9090]);
        assert!(view.default_container.is_none());
    }

    #[test]
    fn auto_without_annotation_takes_all_running() {
        let view = PodView::from_pod(&pod(json!({})));
        assert_eq!(names(view.targets(&ContainerFilter::Auto)), vec!["app", "sidecar"]);
    }

    #[test]
    fn auto_honours_default_container_annotation() {
        let view = PodView::from_pod(&pod(json!({"kubectl.kubernetes.io/default-container": "sidecar"})));
        assert_eq!(names(view.targets(&ContainerFilter::Auto)), vec!["sidecar"]);
        assert_eq!(names(view.targets(&ContainerFilter::All)), vec!["app", "sidecar"]);
        assert_eq!(names(view.targets(&ContainerFilter::Named("app".into()))), vec!["app"]);
    }

    #[test]
    fn named_container_must_be_running() {
        let view = PodView::from_pod(&pod(json!({})));
        assert_eq!(view.targets(&ContainerFilter::Named("idle".into())).count(), 0);
        assert_eq!(view.targets(&ContainerFilter::Named("missing".into())).count(), 0);
    }

    #[test]
    fn flags_resolve_to_filter() {
        assert_eq!(ContainerFilter::from_flags(None, false), ContainerFilter::Auto);
        assert_eq!(ContainerFilter::from_flags(Some(String::new()), false), ContainerFilter::Auto);
        assert_eq!(ContainerFilter::from_flags(Some("app".into()), false), ContainerFilter::Named("app".into()));
        assert_eq!(ContainerFilter::from_flags(Some("app".into()), true), ContainerFilter::All);
    }

    #[test]
    fn bare_pod_has_no_containers() {
        let view = PodView::from_pod(&Pod::default());
        assert!(view.containers.is_empty());
        assert_eq!(view.name, "");
    }
}
