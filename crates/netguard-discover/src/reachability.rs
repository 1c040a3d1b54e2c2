//! Liveness check used by classification and scoring.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::ReachabilityConfig;
use crate::probe::{icmp, tcp};

/// Result of one liveness check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Reachability {
    pub reachable: bool,
    /// Mean echo round trip; `None` without a reply or without ICMP.
    pub rtt_ms: Option<f64>,
    /// Echo loss; `None` when ICMP could not be used.
    pub loss_pct: Option<f64>,
}

impl Reachability {
    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// Decides whether a device answers right now.
///
/// Implementations never fail: any error counts as not reachable.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn check(&self, address: IpAddr) -> Reachability;
}

/// Echo attempts first, then TCP connects against a short allow-list.
pub struct NetworkReachability {
    echo_attempts: u32,
    echo_timeout: Duration,
    connect_timeout: Duration,
    ports: Vec<u16>,
}

impl NetworkReachability {
    pub fn new(config: &ReachabilityConfig) -> Self {
        Self {
            echo_attempts: config.echo_attempts,
            echo_timeout: Duration::from_millis(config.echo_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            ports: config.ports.clone(),
        }
    }
}

#[async_trait]
impl ReachabilityCheck for NetworkReachability {
    async fn check(&self, address: IpAddr) -> Reachability {
        let mut result = Reachability::unreachable();

        if let IpAddr::V4(v4) = address {
            if self.echo_attempts > 0 {
                match icmp::ping(v4, self.echo_attempts, self.echo_timeout).await {
                    Ok(stats) => {
                        result.reachable = stats.received > 0;
                        result.rtt_ms = stats.mean_rtt_ms();
                        result.loss_pct = stats.loss_pct();
                    }
                    Err(e) => {
                        tracing::debug!(address = %address, error = %e, "Echo check unavailable");
                    }
                }
            }
        }

        if !result.reachable {
            for port in &self.ports {
                if tcp::port_open(address, *port, self.connect_timeout).await {
                    result.reachable = true;
                    break;
                }
            }
        }

        result
    }
}

/// Check every address with at most `max_concurrent` checks in flight.
pub async fn check_all(
    checker: Arc<dyn ReachabilityCheck>,
    addresses: impl IntoIterator<Item = IpAddr>,
    max_concurrent: usize,
) -> BTreeMap<IpAddr, Reachability> {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::new();

    for address in addresses {
        let checker = checker.clone();
        let permits = permits.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Reachability::unreachable();
            };
            checker.check(address).await
        });
        handles.push((address, handle));
    }

    let mut results = BTreeMap::new();
    for (address, handle) in handles {
        let reachability = match handle.await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Reachability check aborted");
                Reachability::unreachable()
            }
        };
        results.insert(address, reachability);
    }
    results
}
