use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kube::Client;
use kubeauto_core::{LineSink, StdoutSink};
use kubeauto_kubehub::{start_status_streams, KubeHub, ResourceWatch, WatchScope};
use kubeauto_ops::{KubeTransport, StreamTransport};
use kubeauto_supervisor::{ContainerFilter, PodSupervisor, SupervisorConfig};
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kubeauto", version, about = "Follow resource status, pod logs and port-forwards in one namespace")]
struct Cli {
    /// API group to watch (empty for the core group)
    #[arg(short = 'g', long = "group", env = "KUBEAUTO_GROUP", default_value = "")]
    group: String,

    /// Kubernetes namespace (default: current context)
    #[arg(short = 'n', long = "namespace", env = "KUBEAUTO_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector applied to every list and watch
    #[arg(short = 'l', long = "selector", env = "KUBEAUTO_SELECTOR", default_value = "")]
    selector: String,

    /// Only tail logs from this container
    #[arg(short = 'c', long = "container", env = "KUBEAUTO_CONTAINER")]
    container: Option<String>,

    /// Tail every running container, ignoring the default-container annotation
    #[arg(long = "all-containers", env = "KUBEAUTO_ALL_CONTAINERS", action = ArgAction::SetTrue)]
    all_containers: bool,

    /// Added to each container port to pick the local port
    #[arg(short = 'p', long = "port-offset", env = "KUBEAUTO_PORT_OFFSET", default_value_t = 0, allow_hyphen_values = true)]
    port_offset: i32,

    /// Local address the port-forward listeners bind
    #[arg(long = "address", env = "KUBEAUTO_ADDRESS", default_value = "127.0.0.1")]
    address: IpAddr,

    /// Seconds between port-forward liveness probes
    #[arg(long = "liveness-secs", env = "KUBEAUTO_LIVENESS_SECS", default_value_t = 5)]
    liveness_secs: u64,

    /// Seconds between re-deliveries of every known pod
    #[arg(long = "resync-secs", env = "KUBEAUTO_RESYNC_SECS", default_value_t = 5)]
    resync_secs: u64,
}

impl Cli {
    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            container: ContainerFilter::from_flags(self.container.clone(), self.all_containers),
            port_offset: self.port_offset,
            liveness_period: Duration::from_secs(self.liveness_secs.max(1)),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KUBEAUTO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBEAUTO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBEAUTO_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown(tracker: &TaskTracker, cancel: &CancellationToken) {
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await.context("loading kube config")?;
    let namespace = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    info!(group = %cli.group, ns = %namespace, selector = %cli.selector, "kubeauto starting");

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let sink: Arc<dyn LineSink> = Arc::new(StdoutSink);
    let hub = Arc::new(KubeHub::new(client.clone()).with_resync(Duration::from_secs(cli.resync_secs.max(1))));

    let scope = WatchScope { group: cli.group.clone(), namespace: namespace.clone(), selector: cli.selector.clone() };
    if let Err(e) = start_status_streams(hub.clone(), &scope, sink.clone(), &tracker, &cancel).await {
        error!(error = ?e, "status streams failed to start");
        shutdown(&tracker, &cancel).await;
        return Err(e.context("starting status streams"));
    }

    let pods = match hub.pod_events(&namespace, &cli.selector).await {
        Ok(pods) => pods,
        Err(e) => {
            shutdown(&tracker, &cancel).await;
            return Err(e.context("starting pod feed"));
        }
    };
    let transport: Arc<dyn StreamTransport> = Arc::new(
        KubeTransport::new(client)
            .with_bind_addr(cli.address)
            .with_shutdown(tracker.clone(), cancel.clone()),
    );
    let supervisor = Arc::new(PodSupervisor::new(transport, sink, cli.supervisor_config(), tracker.clone(), cancel.clone()));
    tracker.spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run(pods).await }
    });

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    shutdown(&tracker, &cancel).await;
    info!(logs = supervisor.logs().len(), forwards = supervisor.forwards().len(), "all tasks stopped");
    Ok(())
}
