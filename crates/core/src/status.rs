//! Status inference: fold the many kind-specific `status` shapes into one
//! `(phase, reason, message)` triple.
//!
//! Rules run in a fixed order and later rules overwrite earlier ones:
//! 1. seed from `status.{phase,reason,message}` (or the document root when there is no `status`)
//! 2. scan `status.conditions` in sequence order
//! 3. the kind-specific rule from [`KIND_RULES`], if any
//! 4. a deletion timestamp forces `Deleting`

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Snapshot;

pub const READY: &str = "Ready";
pub const PENDING: &str = "Pending";
pub const FAILED: &str = "Failed";
pub const WAITING: &str = "Waiting";
pub const DELETING: &str = "Deleting";
pub const INACTIVE: &str = "Inactive";
pub const SERVING: &str = "Serving";

const NO_LOAD_BALANCER: &str = "no load balancer found";

/// Condition types that mark the whole object as failed.
const FAILURE_CONDITIONS: &[&str] = &["ReplicaFailure", "PodFailed", "Failed"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTriple {
    pub phase: String,
    pub reason: String,
    pub message: String,
}

impl StatusTriple {
    pub fn new(phase: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { phase: phase.into(), reason: reason.into(), message: message.into() }
    }
}

type KindRule = fn(&Snapshot, &mut StatusTriple) -> Result<(), serde_json::Error>;

/// Kind-specific overrides keyed by `(apiVersion, kind)`.
pub static KIND_RULES: &[(&str, &str, KindRule)] = &[
    ("networking.k8s.io/v1", "Ingress", ingress),
    ("apps/v1", "ReplicaSet", replicated),
    ("apps/v1", "Deployment", replicated),
    ("apps/v1", "StatefulSet", replicated),
    ("apps/v1", "DaemonSet", daemon_set),
    ("v1", "Service", service),
    ("v1", "Pod", pod),
];

fn kind_rule(api_version: &str, kind: &str) -> Option<KindRule> {
    KIND_RULES
        .iter()
        .find(|(v, k, _)| *v == api_version && *k == kind)
        .map(|(_, _, rule)| *rule)
}

/// Infer the normalized status of a snapshot. Never fails: a kind rule whose
/// typed conversion breaks is abandoned and the triple built so far is kept.
pub fn infer(snap: &Snapshot) -> StatusTriple {
    let mut st = seed(snap);
    scan_conditions(snap, &mut st);

    if let Some(rule) = kind_rule(snap.api_version(), snap.kind()) {
        if let Err(e) = rule(snap, &mut st) {
            warn!(kind = %snap.kind(), name = %snap.name(), error = %e, "status conversion failed");
        }
    }

    if snap.is_deleting() {
        st.phase = DELETING.to_string();
        st.message.clear();
    }
    st
}

fn seed(snap: &Snapshot) -> StatusTriple {
    let base = if snap.raw().pointer("/status").map(|v| v.is_object()).unwrap_or(false) { "/status" } else { "" };
    let field = |name: &str| snap.str_at(&format!("{base}/{name}")).unwrap_or("").to_string();
    StatusTriple { phase: field("phase"), reason: field("reason"), message: field("message") }
}

/// Conditions apply in order. A `Ready` condition only counts when its status is `True`.
fn scan_conditions(snap: &Snapshot, st: &mut StatusTriple) {
    let Some(conditions) = snap.raw().pointer("/status/conditions").and_then(|v| v.as_array()) else { return };
    for c in conditions {
        let text = |key: &str| c.get(key).and_then(|v| v.as_str()).unwrap_or("");
        let type_ = text("type");
        if FAILURE_CONDITIONS.contains(&type_) {
            st.phase = FAILED.to_string();
            st.reason = text("reason").to_string();
            st.message = text("message").to_string();
        } else if type_ == READY && text("status") == "True" {
            st.phase = READY.to_string();
        }
    }
}

fn ingress(snap: &Snapshot, st: &mut StatusTriple) -> Result<(), serde_json::Error> {
    let ing: Ingress = serde_json::from_value(snap.raw().clone())?;
    let points = ing
        .status
        .and_then(|s| s.load_balancer)
        .and_then(|lb| lb.ingress)
        .map_or(0, |v| v.len());
    if points > 0 {
        st.phase = READY.to_string();
    } else {
        st.phase = FAILED.to_string();
        st.message = NO_LOAD_BALANCER.to_string();
    }
    Ok(())
}

fn replicated(snap: &Snapshot, st: &mut StatusTriple) -> Result<(), serde_json::Error> {
    let desired = snap.i64_at("/spec/replicas").unwrap_or(1);
    let ready = snap.i64_at("/status/readyReplicas").unwrap_or(0);
    apply_replica_counts(st, desired, ready);
    Ok(())
}

fn daemon_set(snap: &Snapshot, st: &mut StatusTriple) -> Result<(), serde_json::Error> {
    let desired = snap.i64_at("/status/desiredNumberScheduled").unwrap_or(0);
    let ready = snap.i64_at("/status/numberReady").unwrap_or(0);
    apply_replica_counts(st, desired, ready);
    Ok(())
}

fn apply_replica_counts(st: &mut StatusTriple, desired: i64, ready: i64) {
    if desired > 0 {
        if ready == desired {
            st.phase = READY.to_string();
        } else {
            st.phase = PENDING.to_string();
            st.message = format!("ready replicas {} does not match replicas {}", ready, desired);
        }
    } else {
        st.phase = INACTIVE.to_string();
    }
}

fn service(snap: &Snapshot, st: &mut StatusTriple) -> Result<(), serde_json::Error> {
    let svc: Service = serde_json::from_value(snap.raw().clone())?;
    let spec = svc.spec.unwrap_or_default();
    let type_ = spec.type_.unwrap_or_else(|| "ClusterIP".to_string());
    st.message = format!("{}: {}", type_, spec.cluster_ip.unwrap_or_default());
    if type_ == "LoadBalancer" {
        let points = svc
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .map_or(0, |v| v.len());
        if points > 0 {
            st.phase = SERVING.to_string();
        } else {
            st.phase = FAILED.to_string();
            st.message = NO_LOAD_BALANCER.to_string();
        }
    }
    Ok(())
}

fn pod(snap: &Snapshot, st: &mut StatusTriple) -> Result<(), serde_json::Error> {
    let pod: Pod = serde_json::from_value(snap.raw().clone())?;
    let Some(status) = pod.status else { return Ok(()) };

    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for ctr in containers {
        let Some(state) = &ctr.state else { continue };
        if let Some(waiting) = &state.waiting {
            st.phase = WAITING.to_string();
            st.reason = waiting.reason.clone().unwrap_or_default();
            st.message = format!("container {:?} is waiting: {}", ctr.name, waiting.message.as_deref().unwrap_or(""));
        }
        if let Some(terminated) = state.terminated.as_ref().filter(|t| t.exit_code != 0) {
            st.phase = FAILED.to_string();
            st.reason = terminated.reason.clone().unwrap_or_default();
            st.message = format!(
                "container {:?} exited with code {}: {}",
                ctr.name,
                terminated.exit_code,
                terminated.message.as_deref().unwrap_or("")
            );
        }
    }

    let mut ready = status.conditions.iter().flatten().filter(|c| c.type_ == READY).peekable();
    let has_ready = ready.peek().is_some();
    if has_ready && ready.all(|c| c.status == "True") && status.phase.as_deref() == Some("Running") {
        st.phase = READY.to_string();
        st.reason.clear();
        st.message = "Pod is ready and running".to_string();
    }
    Ok(())
}
