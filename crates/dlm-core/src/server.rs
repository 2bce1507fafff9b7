//! The per-host lock server task.
//!
//! Each host runs exactly one `LockServer`. It owns the host's [`LockTable`]
//! and applies [`HostRequest`]s one at a time in arrival order, so all
//! conflict checks and promotions on a host see a consistent table. Notices
//! produced by the table are routed to agents through the transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use dlm_common::config::LockTableConfig;
use dlm_common::types::HostId;

use crate::lock::{LockTable, Notice, Outbound};
use crate::rpc::{AgentMsg, HostRequest};
use crate::transport::Transport;

/// Serializes all mutation of one host's lock table.
pub struct LockServer {
    host: HostId,
    table: LockTable,
    inbox: mpsc::UnboundedReceiver<HostRequest>,
    network: Arc<dyn Transport>,
}

impl LockServer {
    /// Creates a server for `host` and registers its inbox with `network`.
    pub fn new(host: HostId, config: LockTableConfig, network: Arc<dyn Transport>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        network.register_host(host, tx);
        Self {
            host,
            table: LockTable::with_config(host, config),
            inbox,
            network,
        }
    }

    /// Runs until a shutdown request arrives or every sender is gone.
    pub async fn run(mut self) {
        debug!(host = %self.host, "lock server started");
        while let Some(request) = self.inbox.recv().await {
            if !self.handle(request) {
                break;
            }
        }
        let stats = self.table.stats();
        info!(
            host = %self.host,
            grants = stats.grants,
            waits = stats.waits,
            surrenders = stats.surrenders,
            "lock server stopped"
        );
    }

    /// Applies one request. Returns false on shutdown.
    fn handle(&mut self, request: HostRequest) -> bool {
        trace!(host = %self.host, kind = request.kind(), "request");
        let out = match request {
            HostRequest::Lock {
                agent,
                req,
                oid,
                mode,
            } => {
                let (outcome, out) = self.table.request(agent, req, oid.clone(), mode);
                debug!(host = %self.host, %agent, %oid, %mode, ?outcome, "lock request");
                out
            }
            HostRequest::Cancel { agent, req, oid } => {
                debug!(host = %self.host, %agent, %oid, req, "cancel");
                self.table.cancel(agent, req, &oid)
            }
            HostRequest::ReleaseAll { agent } => {
                debug!(host = %self.host, %agent, "release all");
                self.table.release_all(agent)
            }
            HostRequest::Surrender {
                victim,
                waiter,
                waiter_oid,
            } => {
                let out = self.table.surrender(victim, waiter, &waiter_oid);
                debug!(
                    host = %self.host,
                    %victim,
                    %waiter,
                    oid = %waiter_oid,
                    "surrender"
                );
                out
            }
            HostRequest::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
                Vec::new()
            }
            HostRequest::Shutdown => return false,
        };
        self.dispatch(out);
        true
    }

    fn dispatch(&self, out: Vec<Outbound>) {
        for Outbound { agent, notice } in out {
            if let Notice::Granted { ref oid, mode, .. } = notice {
                trace!(host = %self.host, %agent, %oid, %mode, "granted");
            }
            let msg = AgentMsg::Notice {
                host: self.host,
                notice,
            };
            // Notices to ended agents are expected and harmless.
            if let Err(e) = self.network.send_to_agent(self.host, agent, msg) {
                debug!(host = %self.host, %agent, error = %e, "notice not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_common::types::{AgentId, Oid};
    use tokio::sync::oneshot;

    use crate::lock::LockMode;
    use crate::transport::MemoryNetwork;

    const H1: HostId = HostId::new(1);

    #[tokio::test]
    async fn test_server_grants_and_notifies() {
        let network = MemoryNetwork::shared();
        let server = LockServer::new(H1, LockTableConfig::default(), network.clone());
        let handle = tokio::spawn(server.run());

        let agent = AgentId::new(H1, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.register_agent(agent, tx);

        let oid = Oid::parse("db/t1").unwrap();
        network
            .send_to_host(
                H1,
                H1,
                HostRequest::Lock {
                    agent,
                    req: 1,
                    oid: oid.clone(),
                    mode: LockMode::Write,
                },
            )
            .unwrap();

        match rx.recv().await.unwrap() {
            AgentMsg::Notice {
                notice: Notice::Granted { req, mode, .. },
                ..
            } => {
                assert_eq!(req, 1);
                assert_eq!(mode, LockMode::Write);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let (reply, snapshot) = oneshot::channel();
        network
            .send_to_host(H1, H1, HostRequest::Snapshot { reply })
            .unwrap();
        let snapshot = snapshot.await.unwrap();
        assert_eq!(snapshot.held_by(agent, &oid), Some(LockMode::Write));

        network.send_to_host(H1, H1, HostRequest::Shutdown).unwrap();
        handle.await.unwrap();
    }
}
