//! Discovery of reachable bridge servers among candidate endpoints.
//!
//! Every call completes exactly once: candidates are probed concurrently
//! under one shared deadline and the reachable servers are returned
//! together. Probes still running at the deadline are aborted.

use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;

use super::probe;
use crate::models::endpoint::Endpoint;
use crate::models::health::HealthReport;

/// A candidate that answered its probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    /// Endpoint that answered.
    pub endpoint: Endpoint,
    /// Its health report.
    pub report: HealthReport,
}

/// Probe `candidates` concurrently and return the reachable ones, in
/// candidate order.
pub async fn discover(candidates: Vec<Endpoint>, timeout: Duration) -> Vec<DiscoveredServer> {
    let mut probes = JoinSet::new();
    for (index, endpoint) in candidates.into_iter().enumerate() {
        probes.spawn(async move {
            let outcome = probe::check(&endpoint, timeout).await;
            (index, endpoint, outcome)
        });
    }

    let mut found = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(pending = probes.len(), "discovery deadline reached");
                probes.abort_all();
                break;
            }
            joined = probes.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok((index, endpoint, Ok(report))) => {
                        found.push((index, DiscoveredServer { endpoint, report }));
                    }
                    Ok((_, endpoint, Err(err))) => {
                        debug!(address = endpoint.address(), port = endpoint.port(), %err, "candidate unreachable");
                    }
                    Err(err) => debug!(%err, "discovery probe task failed"),
                }
            }
        }
    }

    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, server)| server).collect()
}

/// Expand `host` and a port range into candidate endpoints.
#[must_use]
pub fn candidates(
    hosts: &[String],
    ports: &[u16],
    auth_token: Option<&str>,
) -> Vec<Endpoint> {
    hosts
        .iter()
        .flat_map(|host| {
            ports
                .iter()
                .map(move |port| Endpoint::infer(host, *port, auth_token.map(str::to_owned)))
        })
        .collect()
}
