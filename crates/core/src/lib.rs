//! kubeauto core types: resource snapshots, status inference and line formatting

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod sink;
pub mod status;
pub mod text;

pub use sink::{BufferSink, LineSink, StdoutSink};
pub use status::{infer, StatusTriple};

/// One cluster object captured at a point in time.
///
/// The document is kept as raw JSON; kind-specific code reaches into it with
/// JSON pointers or converts it into a typed `k8s-openapi` object on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    raw: serde_json::Value,
}

impl Snapshot {
    pub fn new(raw: serde_json::Value) -> Self { Self { raw } }

    pub fn raw(&self) -> &serde_json::Value { &self.raw }

    /// Fill `apiVersion`/`kind` when absent. List responses omit them on items.
    pub fn with_type_meta(mut self, api_version: &str, kind: &str) -> Self {
        if let Some(obj) = self.raw.as_object_mut() {
            obj.entry("apiVersion").or_insert_with(|| serde_json::Value::String(api_version.to_string()));
            obj.entry("kind").or_insert_with(|| serde_json::Value::String(kind.to_string()));
        }
        self
    }

    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.raw.pointer(pointer).and_then(|v| v.as_str())
    }

    pub fn i64_at(&self, pointer: &str) -> Option<i64> {
        self.raw.pointer(pointer).and_then(|v| v.as_i64())
    }

    pub fn api_version(&self) -> &str { self.str_at("/apiVersion").unwrap_or("") }

    pub fn kind(&self) -> &str { self.str_at("/kind").unwrap_or("") }

    pub fn name(&self) -> &str { self.str_at("/metadata/name").unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> { self.str_at("/metadata/namespace") }

    /// API group; empty for the core group (`apiVersion: v1`).
    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.raw
            .pointer("/metadata/deletionTimestamp")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// `namespace/name` for namespaced objects, `name` otherwise.
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }
}

impl From<serde_json::Value> for Snapshot {
    fn from(raw: serde_json::Value) -> Self { Self::new(raw) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// A single watch notification for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub snapshot: Snapshot,
}

pub mod prelude {
    pub use super::{infer, LineSink, Snapshot, StatusTriple, WatchEvent, WatchEventKind};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fills_missing_type_meta_only() {
        let s = Snapshot::new(json!({"metadata": {"name": "a"}})).with_type_meta("apps/v1", "Deployment");
        assert_eq!(s.api_version(), "apps/v1");
        assert_eq!(s.kind(), "Deployment");
        assert_eq!(s.group(), "apps");

        let s = Snapshot::new(json!({"apiVersion": "v1", "kind": "Pod"})).with_type_meta("apps/v1", "Deployment");
        assert_eq!(s.kind(), "Pod");
        assert_eq!(s.group(), "");
    }

    #[test]
    fn key_and_deletion() {
        let s = Snapshot::new(json!({"metadata": {"name": "web", "namespace": "ns", "deletionTimestamp": "2024-01-01T00:00:00Z"}}));
        assert_eq!(s.key(), "ns/web");
        assert!(s.is_deleting());
        let s = Snapshot::new(json!({"metadata": {"name": "node-1", "deletionTimestamp": null}}));
        assert_eq!(s.key(), "node-1");
        assert!(!s.is_deleting());
    }
}
