use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::TransportError;

/// Handle to a running port-forward. Dropping it closes the tunnel.
#[derive(Debug)]
pub struct Tunnel {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    done: JoinHandle<Result<(), TransportError>>,
    finished: bool,
}

impl Tunnel {
    /// Wrap a tunnel task that stops when `cancel` fires.
    pub fn new(local_addr: SocketAddr, cancel: CancellationToken, done: JoinHandle<Result<(), TransportError>>) -> Self {
        Self { local_addr, cancel, done, finished: false }
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Address a local client should dial; wildcard binds map to loopback.
    pub fn probe_addr(&self) -> SocketAddr {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local_addr.port())
    }

    pub fn close(&self) { self.cancel.cancel(); }

    /// Token that closes the tunnel when cancelled; handed to liveness monitors.
    pub fn close_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Wait for the tunnel to end. `Ok` after a close, `Err` when the tunnel broke on its own.
    pub async fn closed(&mut self) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        let res = (&mut self.done).await;
        self.finished = true;
        match res {
            Ok(r) => r,
            Err(e) => Err(TransportError::Aborted(e.to_string())),
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_ends_task_and_closed_is_repeatable() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let addr: SocketAddr = "127.0.0.1:8080".parse().expect("addr");
        let mut tunnel = Tunnel::new(addr, cancel, tokio::spawn(async move {
            token.cancelled().await;
            Ok(())
        }));
        assert_eq!(tunnel.local_addr().port(), 8080);
        tunnel.close();
        assert!(tunnel.closed().await.is_ok());
        assert!(tunnel.closed().await.is_ok());
    }

    #[tokio::test]
    async fn broken_tunnel_reports_error() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().expect("addr");
        let mut tunnel = Tunnel::new(addr, CancellationToken::new(), tokio::spawn(async { Err(TransportError::LostConnection) }));
        assert!(matches!(tunnel.closed().await, Err(TransportError::LostConnection)));
    }

    #[tokio::test]
    async fn drop_cancels_token() {
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let addr: SocketAddr = "0.0.0.0:9000".parse().expect("addr");
        let tunnel = Tunnel::new(addr, cancel, tokio::spawn(async { Ok(()) }));
        assert_eq!(tunnel.probe_addr(), "127.0.0.1:9000".parse::<SocketAddr>().expect("addr"));
        drop(tunnel);
        assert!(watcher.is_cancelled());
    }
}
