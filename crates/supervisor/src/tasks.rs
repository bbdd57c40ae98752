//! Bodies of the supervised tasks. Each runs until its stream or tunnel ends or
//! the shared cancel token fires; none of them retries on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kubeauto_core::{text, LineSink};
use kubeauto_ops::{pump_lines, PumpEnd, StreamTransport};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::registry::PortLocks;

pub(crate) struct LogTail {
    pub transport: Arc<dyn StreamTransport>,
    pub sink: Arc<dyn LineSink>,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub cancel: CancellationToken,
}

impl LogTail {
    pub async fn run(self) {
        match self.transport.pod_exists(&self.namespace, &self.pod).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("pod gone before log tail started");
                return;
            }
            Err(e) => {
                debug!(error = %e, "pod lookup failed; skipping log tail");
                return;
            }
        }
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            r = self.transport.open_log_stream(&self.namespace, &self.pod, &self.container, Utc::now()) => r,
        };
        let stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_gone() => {
                debug!(error = %e, "pod gone while opening log stream");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to open log stream");
                return;
            }
        };
        let prefix = text::log_prefix(&self.pod, &self.container);
        let sink = self.sink.as_ref();
        let emit = |line: &str| {
            // blank lines carry nothing worth a prefix
            if !line.is_empty() {
                sink.emit(&text::log_line(&prefix, line));
            }
        };
        match pump_lines(stream, &self.cancel, emit).await {
            PumpEnd::Eof => debug!("log stream ended"),
            PumpEnd::Cancelled => debug!("log tail cancelled"),
            PumpEnd::Failed(e) => warn!(error = %e, "log stream failed"),
        }
    }
}

pub(crate) struct PortForward {
    pub transport: Arc<dyn StreamTransport>,
    pub sink: Arc<dyn LineSink>,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub host_port: u16,
    pub container_port: u16,
    pub locks: PortLocks,
    pub liveness: Duration,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
}

impl PortForward {
    pub async fn run(self) {
        let _port = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            guard = self.locks.lock(self.host_port) => guard,
        };
        let opened = self
            .transport
            .open_port_forward(&self.namespace, &self.pod, self.host_port, self.container_port)
            .await;
        let mut tunnel = match opened {
            Ok(t) => t,
            Err(e) if e.is_gone() => {
                debug!(error = %e, "pod gone before port-forward started");
                return;
            }
            Err(e) => {
                warn!(error = %e, "port-forward failed to start");
                return;
            }
        };
        debug!(local = %tunnel.local_addr(), "tunnel open");
        let notice = format!("forwarding port {} -> {}", self.host_port, self.container_port);
        self.sink.emit(&text::pod_notice(&self.pod, &self.container, &notice));

        let close = tunnel.close_token();
        self.tracker.spawn(monitor_liveness(tunnel.probe_addr(), self.liveness, close.clone(), self.cancel.clone()));

        let ended = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            r = tunnel.closed() => Some(r),
        };
        let res = match ended {
            Some(r) => r,
            None => {
                tunnel.close();
                tunnel.closed().await
            }
        };
        close.cancel();
        match res {
            Ok(()) => debug!("port-forward closed"),
            Err(e) if e.is_gone() => debug!(error = %e, "port-forward lost its pod"),
            Err(e) => warn!(error = %e, "port-forward failed"),
        }
    }
}

/// Dial `addr` every `period`; the first failed dial closes the tunnel through `close`.
pub(crate) async fn monitor_liveness(addr: SocketAddr, period: Duration, close: CancellationToken, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = close.cancelled() => return,
            _ = ticker.tick() => match TcpStream::connect(addr).await {
                Ok(conn) => drop(conn),
                Err(e) => {
                    info!(addr = %addr, error = %e, "liveness probe failed; closing port-forward");
                    close.cancel();
                    return;
                }
            },
        }
    }
}
