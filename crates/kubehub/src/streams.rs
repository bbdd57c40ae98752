//! Status streams: list every watchable kind once, print its status lines, then
//! follow it with one watch task per kind.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use kubeauto_core::{infer, text, LineSink, Snapshot, WatchEvent};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{EventStream, ResourceWatch};

/// Which resources the status streams cover.
#[derive(Debug, Clone, Default)]
pub struct WatchScope {
    /// API group; empty selects the core group.
    pub group: String,
    pub namespace: String,
    pub selector: String,
}

fn emit_status(sink: &dyn LineSink, resource: &str, snap: &Snapshot) {
    let st = infer(snap);
    sink.emit(&text::status_line(resource, snap.name(), &st));
    metrics::counter!("kubeauto_status_lines_total", 1u64, "resource" => resource.to_string());
}

/// List and start watching every watchable kind in `scope`, returning the number of
/// watch tasks spawned on `tracker`. Any discovery, list or watch-open failure is returned.
pub async fn start_status_streams(
    watch: Arc<dyn ResourceWatch>,
    scope: &WatchScope,
    sink: Arc<dyn LineSink>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<usize> {
    let kinds = watch.discover(&scope.group).await?;
    let mut started = 0;
    for kind in kinds {
        if !kind.namespaced {
            warn!(gvk = %kind.gvk_key(), "skipping cluster-scoped kind");
            continue;
        }
        if !kind.watchable() {
            warn!(gvk = %kind.gvk_key(), verbs = ?kind.verbs, "skipping kind without watch verb");
            continue;
        }
        let listing = watch.list(&kind, &scope.namespace, &scope.selector).await?;
        for snap in &listing.items {
            emit_status(sink.as_ref(), &kind.plural, snap);
        }
        let events = watch
            .watch(&kind, &scope.namespace, &scope.selector, &listing.resource_version)
            .await?;
        debug!(gvk = %kind.gvk_key(), items = listing.items.len(), rv = %listing.resource_version, "status stream open");
        tracker.spawn(pump_status(kind.plural.clone(), events, sink.clone(), cancel.clone()));
        started += 1;
    }
    info!(group = %scope.group, ns = %scope.namespace, streams = started, "status streams started");
    Ok(started)
}

/// Print a status line per event until the stream breaks or `cancel` fires. No retry.
async fn pump_status(resource: String, mut events: EventStream<WatchEvent>, sink: Arc<dyn LineSink>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(resource = %resource, "status stream cancelled");
                break;
            }
            next = events.next() => match next {
                Some(Ok(ev)) => {
                    debug!(resource = %resource, event = ?ev.kind, key = %ev.snapshot.key(), "status event");
                    emit_status(sink.as_ref(), &resource, &ev.snapshot);
                }
                Some(Err(e)) => {
                    warn!(resource = %resource, error = %e, "watch stream failed; no further updates for this kind");
                    break;
                }
                None => {
                    warn!(resource = %resource, "watch stream ended");
                    break;
                }
            },
        }
    }
}
