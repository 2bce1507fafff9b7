//! Transaction agents.
//!
//! A transaction agent is the unit a client talks to. It issues lock requests
//! to the lock servers of the hosts involved, tracks their outcomes, takes
//! part in deadlock detection, and owns every lock its transaction holds.
//!
//! # State Machine
//!
//! ```text
//!            lock queued              cycle, victim
//!  Active ──────────────▶ Waiting ───────────────▶ Resolving
//!    ▲                    │   │                        │
//!    └──── all granted ───┘   │ victim with            │ surrender done
//!                             │ abort_on_deadlock      ▼
//!                             └──────▶ Aborted      Waiting
//!
//!  any state ── end ──▶ Ended
//! ```
//!
//! The agent runs as its own task. [`AgentHandle`] is the client side: it
//! validates calls synchronously and then talks to the task over a channel.

mod task;

pub(crate) use task::{Agent, AgentParams};

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use dlm_common::error::{DlmError, DlmResult};
use dlm_common::types::{AgentId, ClientId, HostId, Oid};

use crate::lock::LockMode;
use crate::rpc::AgentMsg;
use crate::transport::Transport;

/// How many hosts must grant a multi-host lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Requirement {
    /// Every host must grant.
    #[default]
    All,
    /// The first grant suffices; the other requests are cancelled.
    Any,
}

/// A lock request as issued by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSpec {
    /// Object to lock.
    pub oid: Oid,
    /// Requested mode. Defaults to write.
    pub mode: LockMode,
    /// Target hosts. `None` means the agent's home host.
    pub hosts: Option<Vec<HostId>>,
    /// Multi-host requirement. Defaults to all.
    pub requirement: Requirement,
}

impl LockSpec {
    /// Creates a write request on the local host.
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            mode: LockMode::Write,
            hosts: None,
            requirement: Requirement::All,
        }
    }

    /// Creates a write request from a `/`-separated path.
    pub fn parse(path: &str) -> DlmResult<Self> {
        Ok(Self::new(Oid::parse(path)?))
    }

    /// Requests a read lock.
    #[must_use]
    pub fn read(mut self) -> Self {
        self.mode = LockMode::Read;
        self
    }

    /// Requests a write lock.
    #[must_use]
    pub fn write(mut self) -> Self {
        self.mode = LockMode::Write;
        self
    }

    /// Sets the mode.
    #[must_use]
    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Targets the given hosts.
    #[must_use]
    pub fn on_hosts(mut self, hosts: impl IntoIterator<Item = HostId>) -> Self {
        self.hosts = Some(hosts.into_iter().collect());
        self
    }

    /// Completes on the first grant.
    #[must_use]
    pub fn any(mut self) -> Self {
        self.requirement = Requirement::Any;
        self
    }

    /// Sets the requirement.
    #[must_use]
    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }
}

/// A lock given up, or a request moved back, while resolving a deadlock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Deadlock {
    /// The object.
    pub oid: Oid,
    /// The host whose lock table it lives in.
    pub host: HostId,
}

impl fmt::Display for Deadlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.oid, self.host)
    }
}

/// Answer to a blocking lock call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReply {
    /// The request is satisfied.
    Ok {
        /// Deadlocks resolved so far in this transaction.
        deadlocks: Vec<Deadlock>,
    },
    /// The transaction was aborted or ended and holds nothing.
    HaveNone {
        /// Deadlocks resolved in this transaction.
        deadlocks: Vec<Deadlock>,
    },
}

impl LockReply {
    /// Returns true for [`LockReply::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, LockReply::Ok { .. })
    }

    /// Returns the deadlocks list.
    pub fn deadlocks(&self) -> &[Deadlock] {
        match self {
            LockReply::Ok { deadlocks } | LockReply::HaveNone { deadlocks } => deadlocks,
        }
    }
}

/// Overall lock status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Every request succeeded.
    HaveAllLocks,
    /// The transaction was aborted and holds nothing.
    HaveNone,
}

/// Answer to `await_all_locks` and `begin_transaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    /// Overall status.
    pub status: LockStatus,
    /// Deadlocks resolved in this transaction.
    pub deadlocks: Vec<Deadlock>,
}

impl LockResult {
    /// Creates a result.
    pub fn new(status: LockStatus, deadlocks: Vec<Deadlock>) -> Self {
        Self { status, deadlocks }
    }

    /// Returns true if every request succeeded.
    pub fn have_all_locks(&self) -> bool {
        self.status == LockStatus::HaveAllLocks
    }
}

/// Options for a new transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnOptions {
    /// Abort instead of surrendering when chosen as deadlock victim.
    /// `None` takes the configured default.
    pub abort_on_deadlock: Option<bool>,
    /// The only caller the agent accepts. `None` means the caller of
    /// `begin_transaction`.
    pub client: Option<ClientId>,
}

impl TxnOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `abort_on_deadlock`.
    #[must_use]
    pub fn abort_on_deadlock(mut self, abort: bool) -> Self {
        self.abort_on_deadlock = Some(abort);
        self
    }

    /// Sets the client identity.
    #[must_use]
    pub fn client(mut self, client: ClientId) -> Self {
        self.client = Some(client);
        self
    }

    /// Parses options from key/value pairs.
    ///
    /// Recognized keys are `abort_on_deadlock` (`true`/`false`) and `client`
    /// (an unsigned integer). Anything else is rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> DlmResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let invalid = || DlmError::InvalidOption {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "abort_on_deadlock" => {
                    options.abort_on_deadlock = Some(value.parse().map_err(|_| invalid())?);
                }
                "client" => {
                    let id: u64 = value.parse().map_err(|_| invalid())?;
                    options.client = Some(ClientId::new(id));
                }
                _ => {
                    return Err(DlmError::UnknownOption {
                        key: key.to_string(),
                    })
                }
            }
        }
        Ok(options)
    }
}

/// State of a transaction agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// No request is blocked.
    Active,
    /// At least one request is queued.
    Waiting,
    /// Giving up locks to break a deadlock.
    Resolving,
    /// Aborted as deadlock victim; holds nothing.
    Aborted,
    /// Ended by the client.
    Ended,
}

impl AgentStatus {
    /// Returns true for states no request can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Aborted | AgentStatus::Ended)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "ACTIVE"),
            AgentStatus::Waiting => write!(f, "WAITING"),
            AgentStatus::Resolving => write!(f, "RESOLVING"),
            AgentStatus::Aborted => write!(f, "ABORTED"),
            AgentStatus::Ended => write!(f, "ENDED"),
        }
    }
}

/// A snapshot of an agent's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    /// The agent.
    pub agent: AgentId,
    /// Its client.
    pub client: ClientId,
    /// Current state.
    pub status: AgentStatus,
    /// Held locks, sorted by host and OID.
    pub held: Vec<(HostId, Oid, LockMode)>,
    /// Outstanding requests, sorted by host and OID.
    pub pending: Vec<(HostId, Oid, LockMode)>,
    /// Deadlocks list.
    pub deadlocks: Vec<Deadlock>,
    /// Whether the agent aborts when chosen as victim.
    pub abort_on_deadlock: bool,
}

impl AgentInfo {
    /// Returns the mode held on (`host`, `oid`).
    pub fn held_mode(&self, host: HostId, oid: &Oid) -> Option<LockMode> {
        self.held
            .iter()
            .find(|(h, o, _)| *h == host && o == oid)
            .map(|(_, _, m)| *m)
    }

    /// Returns true if a request on (`host`, `oid`) is outstanding.
    pub fn is_pending(&self, host: HostId, oid: &Oid) -> bool {
        self.pending.iter().any(|(h, o, _)| *h == host && o == oid)
    }
}

/// Validates a request and resolves its default host to `home`.
pub(crate) fn resolve_spec(
    mut spec: LockSpec,
    home: HostId,
    network: &dyn Transport,
) -> DlmResult<LockSpec> {
    let mut hosts = spec.hosts.take().unwrap_or_else(|| vec![home]);
    if hosts.is_empty() {
        return Err(DlmError::EmptyHostSet);
    }
    hosts.sort();
    hosts.dedup();
    if let Some(&host) = hosts.iter().find(|h| !network.has_host(**h)) {
        return Err(DlmError::UnknownHost { host });
    }
    spec.hosts = Some(hosts);
    Ok(spec)
}

/// A call from the client to its agent.
#[derive(Debug)]
pub enum Command {
    /// Issue a lock request; `reply` is `None` for non-blocking calls.
    Lock {
        /// The validated request.
        spec: LockSpec,
        /// Where to answer once the request is satisfied.
        reply: Option<oneshot::Sender<LockReply>>,
    },
    /// Wait for every outstanding request.
    Await {
        /// Reply channel.
        reply: oneshot::Sender<LockResult>,
    },
    /// Report state.
    Info {
        /// Reply channel.
        reply: oneshot::Sender<AgentInfo>,
    },
    /// End the transaction.
    End {
        /// Acknowledged once release requests are enqueued.
        reply: oneshot::Sender<()>,
    },
}

/// Client handle to a transaction agent.
///
/// Handles are cheap to clone. Every call checks that the handle's caller is
/// the agent's client and validates its arguments before anything is sent.
#[derive(Clone)]
pub struct AgentHandle {
    agent: AgentId,
    client: ClientId,
    caller: ClientId,
    tx: mpsc::UnboundedSender<AgentMsg>,
    network: Arc<dyn Transport>,
}

impl AgentHandle {
    pub(crate) fn new(
        agent: AgentId,
        client: ClientId,
        caller: ClientId,
        tx: mpsc::UnboundedSender<AgentMsg>,
        network: Arc<dyn Transport>,
    ) -> Self {
        Self {
            agent,
            client,
            caller,
            tx,
            network,
        }
    }

    /// Returns the agent id.
    pub fn agent_id(&self) -> AgentId {
        self.agent
    }

    /// Returns the client the agent accepts calls from.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Returns the identity this handle calls as.
    pub fn caller(&self) -> ClientId {
        self.caller
    }

    /// Returns a handle to the same agent calling as `caller`.
    #[must_use]
    pub fn with_caller(&self, caller: ClientId) -> Self {
        Self {
            caller,
            ..self.clone()
        }
    }

    /// Requests a lock and waits until it is satisfied or the transaction
    /// is aborted.
    pub async fn lock(&self, spec: LockSpec) -> DlmResult<LockReply> {
        let spec = self.prepare(spec)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lock {
            spec,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| self.gone())
    }

    /// Requests a lock without waiting for the outcome.
    pub fn lock_nowait(&self, spec: LockSpec) -> DlmResult<()> {
        let spec = self.prepare(spec)?;
        self.send(Command::Lock { spec, reply: None })
    }

    /// Requests several locks without waiting, in order.
    ///
    /// All requests are validated before the first is sent.
    pub fn lock_objects(&self, specs: Vec<LockSpec>) -> DlmResult<()> {
        let specs = specs
            .into_iter()
            .map(|s| self.prepare(s))
            .collect::<DlmResult<Vec<_>>>()?;
        for spec in specs {
            self.send(Command::Lock { spec, reply: None })?;
        }
        Ok(())
    }

    /// Waits until every outstanding request is resolved.
    pub async fn await_all_locks(&self) -> DlmResult<LockResult> {
        self.check_caller()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Await { reply })?;
        rx.await.map_err(|_| self.gone())
    }

    /// Returns a snapshot of the agent's state.
    pub async fn info(&self) -> DlmResult<AgentInfo> {
        self.check_caller()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Info { reply })?;
        rx.await.map_err(|_| self.gone())
    }

    /// Ends the transaction, releasing everything on every host.
    ///
    /// Ending an agent that is already gone succeeds.
    pub async fn end(&self) -> DlmResult<()> {
        self.check_caller()?;
        let (reply, rx) = oneshot::channel();
        if self.send(Command::End { reply }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Returns true once the agent task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn check_caller(&self) -> DlmResult<()> {
        if self.caller != self.client {
            return Err(DlmError::NotClient {
                agent: self.agent,
                caller: self.caller,
            });
        }
        Ok(())
    }

    fn prepare(&self, spec: LockSpec) -> DlmResult<LockSpec> {
        self.check_caller()?;
        resolve_spec(spec, self.agent.host(), self.network.as_ref())
    }

    fn send(&self, command: Command) -> DlmResult<()> {
        self.tx
            .send(AgentMsg::Command(command))
            .map_err(|_| self.gone())
    }

    fn gone(&self) -> DlmError {
        DlmError::AgentGone { agent: self.agent }
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent", &self.agent)
            .field("client", &self.client)
            .field("caller", &self.caller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_spec_defaults() {
        let spec = LockSpec::parse("db/t1").unwrap();
        assert_eq!(spec.mode, LockMode::Write);
        assert_eq!(spec.hosts, None);
        assert_eq!(spec.requirement, Requirement::All);

        let spec = spec.read().on_hosts([HostId::new(2)]).any();
        assert_eq!(spec.mode, LockMode::Read);
        assert_eq!(spec.hosts, Some(vec![HostId::new(2)]));
        assert_eq!(spec.requirement, Requirement::Any);

        assert!(matches!(LockSpec::parse(""), Err(DlmError::EmptyOid)));
    }

    #[test]
    fn test_txn_options_from_pairs() {
        let options =
            TxnOptions::from_pairs([("abort_on_deadlock", "true"), ("client", "7")]).unwrap();
        assert_eq!(options.abort_on_deadlock, Some(true));
        assert_eq!(options.client, Some(ClientId::new(7)));

        let err = TxnOptions::from_pairs([("timeout", "5")]).unwrap_err();
        assert_eq!(
            err,
            DlmError::UnknownOption {
                key: "timeout".to_string()
            }
        );
        assert!(err.is_validation());

        let err = TxnOptions::from_pairs([("abort_on_deadlock", "maybe")]).unwrap_err();
        assert!(matches!(err, DlmError::InvalidOption { .. }));

        assert_eq!(
            TxnOptions::from_pairs(Vec::<(String, String)>::new()).unwrap(),
            TxnOptions::default()
        );
    }

    #[test]
    fn test_lock_reply_accessors() {
        let deadlock = Deadlock {
            oid: Oid::parse("x").unwrap(),
            host: HostId::new(1),
        };
        let reply = LockReply::HaveNone {
            deadlocks: vec![deadlock.clone()],
        };
        assert!(!reply.is_ok());
        assert_eq!(reply.deadlocks(), &[deadlock.clone()]);
        assert_eq!(deadlock.to_string(), "[x]@h1");
        assert!(AgentStatus::Aborted.is_terminal());
        assert!(!AgentStatus::Resolving.is_terminal());
    }
}
