//! TCP connect probe against a short list of telling ports.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netguard_core::DiscoveryProtocol;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{PartialRecord, Probe, ProbeSink};
use crate::error::ProbeError;
use crate::scope::Scope;

pub struct TcpPortProbe {
    ports: Vec<u16>,
    connect_timeout: Duration,
    connects: Arc<Semaphore>,
}

impl TcpPortProbe {
    pub fn new(ports: Vec<u16>, connect_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            ports,
            connect_timeout,
            connects: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

/// True when a connection to `address:port` completes within `timeout`.
pub(crate) async fn port_open(address: IpAddr, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(address, port))).await,
        Ok(Ok(_))
    )
}

/// Open ports of one host, trying them concurrently under the shared cap.
async fn scan_host(
    address: IpAddr,
    ports: Vec<u16>,
    timeout: Duration,
    connects: Arc<Semaphore>,
) -> BTreeSet<u16> {
    let mut attempts = JoinSet::new();
    for port in ports {
        let connects = connects.clone();
        attempts.spawn(async move {
            let Ok(_permit) = connects.acquire_owned().await else {
                return None;
            };
            port_open(address, port, timeout).await.then_some(port)
        });
    }

    let mut open = BTreeSet::new();
    while let Some(result) = attempts.join_next().await {
        if let Ok(Some(port)) = result {
            open.insert(port);
        }
    }
    open
}

#[async_trait]
impl Probe for TcpPortProbe {
    fn protocol(&self) -> DiscoveryProtocol {
        DiscoveryProtocol::Tcp
    }

    async fn probe(
        &self,
        scope: &Scope,
        timeout: Duration,
        sink: &ProbeSink,
    ) -> Result<(), ProbeError> {
        let connect_timeout = self.connect_timeout.min(timeout);
        let mut hosts = JoinSet::new();

        for host in scope.hosts() {
            let address = IpAddr::V4(host);
            let ports = self.ports.clone();
            let connects = self.connects.clone();
            hosts.spawn(async move {
                let open = scan_host(address, ports, connect_timeout, connects).await;
                (address, open)
            });
        }

        // Dropping the set on cancellation aborts outstanding connects.
        while let Some(result) = hosts.join_next().await {
            match result {
                Ok((address, open)) if !open.is_empty() => {
                    sink.push(PartialRecord::new(address, DiscoveryProtocol::Tcp).with_ports(open));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "TCP host task failed"),
            }
        }

        Ok(())
    }
}
