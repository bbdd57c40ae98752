//! kubeauto supervisor: turns pod notifications into deduplicated log tails and
//! port-forwards, each tracked in a keyed registry and torn down on cancellation.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kubeauto_core::LineSink;
use kubeauto_ops::StreamTransport;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, warn};

pub mod pod;
pub mod registry;
mod tasks;

pub use pod::{ContainerFilter, ContainerView, PodView};
pub use registry::{PortLocks, TaskRegistry, TaskSlot};

use tasks::{LogTail, PortForward};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub container: ContainerFilter,
    /// Added to each container port to get the local port.
    pub port_offset: i32,
    pub liveness_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { container: ContainerFilter::Auto, port_offset: 0, liveness_period: Duration::from_secs(5) }
    }
}

/// Identity of a log tail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub pod: String,
    pub container: String,
}

impl LogKey {
    pub fn new(pod: impl Into<String>, container: impl Into<String>) -> Self {
        Self { pod: pod.into(), container: container.into() }
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

/// `offset + container_port` as a bindable local port.
pub fn host_port(offset: i32, container_port: i32) -> Option<u16> {
    let port = i64::from(offset) + i64::from(container_port);
    u16::try_from(port).ok().filter(|p| *p != 0)
}

pub struct PodSupervisor {
    transport: Arc<dyn StreamTransport>,
    sink: Arc<dyn LineSink>,
    config: SupervisorConfig,
    logs: TaskRegistry<LogKey>,
    forwards: TaskRegistry<u16>,
    port_locks: PortLocks,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PodSupervisor {
    /// Tasks are spawned on `tracker` and stop when `cancel` fires.
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        sink: Arc<dyn LineSink>,
        config: SupervisorConfig,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            sink,
            config,
            logs: TaskRegistry::new(),
            forwards: TaskRegistry::new(),
            port_locks: PortLocks::new(),
            tracker,
            cancel,
        }
    }

    pub fn logs(&self) -> &TaskRegistry<LogKey> { &self.logs }

    pub fn forwards(&self) -> &TaskRegistry<u16> { &self.forwards }

    /// Start whatever log tails and port-forwards `pod` calls for that are not
    /// already running. Safe to call for every add and update notification.
    pub fn handle_pod(&self, pod: &Pod) {
        if self.cancel.is_cancelled() {
            return;
        }
        let view = PodView::from_pod(pod);
        for ctr in view.targets(&self.config.container) {
            self.start_log_tail(&view, ctr);
            for &port in &ctr.ports {
                self.start_port_forward(&view, ctr, port);
            }
        }
    }

    /// Handle every pod from `pods` until the feed ends or the supervisor is cancelled.
    pub async fn run<S>(&self, pods: S)
    where
        S: Stream<Item = anyhow::Result<Pod>>,
    {
        futures::pin_mut!(pods);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("pod feed cancelled");
                    break;
                }
                next = pods.next() => match next {
                    Some(Ok(pod)) => self.handle_pod(&pod),
                    Some(Err(e)) => warn!(error = %e, "pod feed error"),
                    None => {
                        info!("pod feed ended");
                        break;
                    }
                },
            }
        }
    }

    fn start_log_tail(&self, view: &PodView, ctr: &ContainerView) -> bool {
        let task = LogTail {
            transport: self.transport.clone(),
            sink: self.sink.clone(),
            namespace: view.namespace.clone(),
            pod: view.name.clone(),
            container: ctr.name.clone(),
            cancel: self.cancel.clone(),
        };
        let span = info_span!("log_tail", pod = %view.name, container = %ctr.name);
        let started = self
            .logs
            .spawn_if_absent(LogKey::new(&view.name, &ctr.name), &self.tracker, "logs", span, move || task.run());
        if started {
            debug!(pod = %view.name, container = %ctr.name, "log tail started");
        }
        started
    }

    fn start_port_forward(&self, view: &PodView, ctr: &ContainerView, port: i32) -> bool {
        let (Some(host), Ok(container_port)) = (host_port(self.config.port_offset, port), u16::try_from(port)) else {
            debug!(pod = %view.name, container = %ctr.name, port, offset = self.config.port_offset, "port out of range; not forwarding");
            return false;
        };
        let task = PortForward {
            transport: self.transport.clone(),
            sink: self.sink.clone(),
            namespace: view.namespace.clone(),
            pod: view.name.clone(),
            container: ctr.name.clone(),
            host_port: host,
            container_port,
            locks: self.port_locks.clone(),
            liveness: self.config.liveness_period,
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        };
        let span = info_span!("port_forward", pod = %view.name, container = %ctr.name, port = host);
        let started = self.forwards.spawn_if_absent(host, &self.tracker, "port-forward", span, move || task.run());
        if started {
            debug!(pod = %view.name, container = %ctr.name, host, container_port, "port-forward started");
        }
        started
    }
}
