//! kubeauto ops: byte-level access to pod containers (follow-mode log streams
//! and local port-forward tunnels).

#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    Client,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

pub mod lines;
pub mod tunnel;

pub use lines::{pump_lines, PumpEnd};
pub use tunnel::Tunnel;

/// Raw log bytes as they arrive from the API server.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

const LOG_CHANNEL_CAP: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("pod {0} not found")]
    NotFound(String),
    #[error("lost connection to pod")]
    LostConnection,
    #[error("port-forward: {0}")]
    Forward(String),
    #[error("tunnel task aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The pod went away; an expected race rather than a failure.
    pub fn is_gone(&self) -> bool {
        match self {
            TransportError::NotFound(_) | TransportError::LostConnection => true,
            TransportError::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

/// Byte tunnel to pod containers.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, TransportError>;

    /// Follow the container's log starting at `since`.
    async fn open_log_stream(&self, namespace: &str, pod: &str, container: &str, since: DateTime<Utc>) -> Result<ByteStream, TransportError>;

    /// Listen on `local_port` and forward each accepted connection to `container_port` in the pod.
    async fn open_port_forward(&self, namespace: &str, pod: &str, local_port: u16, container_port: u16) -> Result<Tunnel, TransportError>;
}

/// [`StreamTransport`] backed by a kube client (log subresource + websocket port-forward).
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
    bind_addr: IpAddr,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn reader and tunnel tasks on `tracker` and stop them when `cancel` fires.
    pub fn with_shutdown(mut self, tracker: TaskTracker, cancel: CancellationToken) -> Self {
        self.tracker = tracker;
        self.cancel = cancel;
        self
    }

    /// Address the local port-forward listeners bind to (default 127.0.0.1).
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl StreamTransport for KubeTransport {
    async fn pod_exists(&self, namespace: &str, pod: &str) -> Result<bool, TransportError> {
        Ok(self.pods(namespace).get_opt(pod).await?.is_some())
    }

    async fn open_log_stream(&self, namespace: &str, pod: &str, container: &str, since: DateTime<Utc>) -> Result<ByteStream, TransportError> {
        let lp = LogParams {
            follow: true,
            container: Some(container.to_string()),
            since_time: Some(since),
            ..LogParams::default()
        };
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(LOG_CHANNEL_CAP);
        self.tracker
            .spawn(read_log(self.pods(namespace), pod.to_string(), lp, opened_tx, tx, self.cancel.clone()));
        opened_rx
            .await
            .map_err(|_| TransportError::Aborted("log reader exited before opening".into()))??;
        debug!(ns = %namespace, pod = %pod, container = %container, "log stream opened");
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) }).boxed())
    }

    async fn open_port_forward(&self, namespace: &str, pod: &str, local_port: u16, container_port: u16) -> Result<Tunnel, TransportError> {
        let listener = TcpListener::bind((self.bind_addr, local_port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = self.cancel.child_token();
        let done = self
            .tracker
            .spawn(accept_loop(listener, self.pods(namespace), pod.to_string(), container_port, self.tracker.clone(), cancel.clone()));
        info!(ns = %namespace, pod = %pod, local_port, container_port, "port-forward listening");
        Ok(Tunnel::new(local_addr, cancel, done))
    }
}

/// Own the log reader for its whole life and hand chunks to `tx` until the log
/// ends, the receiving side goes away or `cancel` fires.
async fn read_log(
    api: Api<Pod>,
    pod: String,
    lp: LogParams,
    opened: oneshot::Sender<Result<(), TransportError>>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    cancel: CancellationToken,
) {
    use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Aborted("cancelled while opening log stream".into())),
        r = api.log_stream(&pod, &lp) => r.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => TransportError::NotFound(pod.clone()),
            e => TransportError::Kube(e),
        }),
    };
    let reader = match started {
        Ok(r) => r,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    if opened.send(Ok(())).is_err() {
        return;
    }
    // futures::io::AsyncRead -> tokio::io::AsyncRead -> Stream<Bytes>
    relay_chunks(ReaderStream::new(reader.compat()), &tx, &cancel).await;
    debug!(pod = %pod, "log reader closed");
}

/// Forward `chunks` into `tx` until the stream ends, the receiver is dropped or `cancel` fires.
async fn relay_chunks<S>(chunks: S, tx: &mpsc::Sender<std::io::Result<Bytes>>, cancel: &CancellationToken)
where
    S: futures::Stream<Item = std::io::Result<Bytes>>,
{
    futures::pin_mut!(chunks);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tx.closed() => None,
            chunk = chunks.next() => chunk,
        };
        let Some(chunk) = next else { return };
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

/// Accept local connections until cancelled or until a connection finds the pod gone.
async fn accept_loop(
    listener: TcpListener,
    api: Api<Pod>,
    pod: String,
    port: u16,
    tracker: TaskTracker,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let (lost_tx, mut lost_rx) = mpsc::channel::<TransportError>(1);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            Some(err) = lost_rx.recv() => return Err(err),
            accepted = listener.accept() => {
                let (conn, peer) = accepted?;
                debug!(pod = %pod, port, peer = %peer, "tunnel connection accepted");
                let (api, pod, lost, cancel) = (api.clone(), pod.clone(), lost_tx.clone(), cancel.clone());
                tracker.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        res = forward_connection(&api, &pod, port, conn) => match res {
                            Err(e) if e.is_gone() => { let _ = lost.try_send(e); }
                            Err(e) => debug!(pod = %pod, port, error = %e, "tunnel connection failed"),
                            Ok(()) => {}
                        },
                    }
                });
            }
        }
    }
}

async fn forward_connection(api: &Api<Pod>, pod: &str, port: u16, mut conn: TcpStream) -> Result<(), TransportError> {
    let mut forwarder = match api.portforward(pod, &[port]).await {
        Ok(f) => f,
        Err(e) => {
            return Err(match api.get_opt(pod).await {
                Ok(None) => TransportError::LostConnection,
                _ => TransportError::Kube(e),
            });
        }
    };
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| TransportError::Forward(format!("no stream for port {port}")))?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder.join().await.map_err(|e| TransportError::Forward(e.to_string()))?;
    Ok(())
}
