//! Randomized contention workloads.
//!
//! A [`Workload`] draws transactions over a small object hierarchy so that
//! prefix conflicts and deadlocks are frequent, runs them concurrently and
//! samples every lock table for conflicting holders while they run. The
//! `dlm-sim` binary drives its own runs from [`Workload::plan`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;

use dlm_common::error::{DlmError, DlmResult};
use dlm_common::types::{ClientId, HostId, Oid};
use dlm_core::{Cluster, LockMode, LockSpec, Requirement, TxnOptions};

/// Shape of a generated workload.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Random seed.
    pub seed: u64,
    /// Number of transactions.
    pub txns: usize,
    /// Requests per transaction.
    pub locks_per_txn: usize,
    /// Tables under the single database.
    pub tables: usize,
    /// Keys under each table.
    pub keys: usize,
    /// Probability that a request is a write.
    pub write_ratio: f64,
    /// Probability that a request names two hosts.
    pub multi_host_ratio: f64,
    /// Upper bound of the time a transaction keeps its locks before ending.
    pub max_hold: Duration,
}

/// One generated transaction.
#[derive(Debug, Clone)]
pub struct PlannedTxn {
    /// Client id of the transaction.
    pub client: ClientId,
    /// Home host of its agent.
    pub home: HostId,
    /// Requests issued one after another.
    pub specs: Vec<LockSpec>,
    /// Time the locks are kept before ending.
    pub hold: Duration,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            seed: 1,
            txns: 40,
            locks_per_txn: 3,
            tables: 2,
            keys: 3,
            write_ratio: 0.5,
            multi_host_ratio: 0.2,
            max_hold: Duration::ZERO,
        }
    }
}

/// What a workload run observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    /// Transactions whose requests all succeeded.
    pub completed: usize,
    /// Transactions aborted as deadlock victims.
    pub aborted: usize,
    /// Conflicting holder pairs seen by the sampler.
    pub violations: usize,
    /// Lock table entries left after every transaction ended.
    pub leftover_entries: usize,
}

impl Workload {
    /// Returns the hierarchy `db / t{i} / k{j}`.
    pub fn objects(&self) -> DlmResult<Vec<Oid>> {
        let db = Oid::parse("db")?;
        let mut oids = Vec::new();
        for t in 0..self.tables {
            let table = db.child(format!("t{}", t));
            for k in 0..self.keys {
                oids.push(table.child(format!("k{}", k)));
            }
            oids.push(table);
        }
        oids.push(db);
        Ok(oids)
    }

    /// Draws every transaction of the workload over `hosts`. The same seed
    /// and hosts always give the same plan.
    pub fn plan(&self, hosts: &[HostId]) -> DlmResult<Vec<PlannedTxn>> {
        if hosts.is_empty() {
            return Err(DlmError::internal("workload needs at least one host"));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let objects = self.objects()?;
        let max_hold = self.max_hold.as_micros() as u64;
        Ok((0..self.txns)
            .map(|i| {
                let home = hosts[rng.gen_range(0..hosts.len())];
                let specs = (0..self.locks_per_txn)
                    .map(|_| self.draw(&mut rng, &objects, hosts))
                    .collect();
                let hold = Duration::from_micros(rng.gen_range(0..=max_hold));
                PlannedTxn {
                    client: ClientId::new(i as u64 + 1),
                    home,
                    specs,
                    hold,
                }
            })
            .collect())
    }

    fn draw(&self, rng: &mut StdRng, objects: &[Oid], hosts: &[HostId]) -> LockSpec {
        // Keys are far more likely than whole tables, the database rarest.
        let oid = loop {
            let oid = &objects[rng.gen_range(0..objects.len())];
            let keep = match oid.len() {
                1 => rng.gen_ratio(1, 20),
                2 => rng.gen_ratio(1, 4),
                _ => true,
            };
            if keep {
                break oid.clone();
            }
        };
        let mode = if rng.gen_bool(self.write_ratio) {
            LockMode::Write
        } else {
            LockMode::Read
        };
        let first = hosts[rng.gen_range(0..hosts.len())];
        let spec = LockSpec::new(oid).with_mode(mode).on_hosts([first]);
        if hosts.len() > 1 && rng.gen_bool(self.multi_host_ratio) {
            let second = hosts[rng.gen_range(0..hosts.len())];
            let requirement = if rng.gen_bool(0.5) {
                Requirement::All
            } else {
                Requirement::Any
            };
            spec.on_hosts([first, second]).with_requirement(requirement)
        } else {
            spec
        }
    }

    /// Runs the workload on `cluster` and ends every transaction.
    pub async fn run(&self, cluster: Arc<Cluster>) -> DlmResult<Report> {
        let hosts = cluster.hosts();
        let mut workers = JoinSet::new();
        for planned in self.plan(&hosts)? {
            let manager = cluster.node(planned.home)?;
            workers.spawn(async move {
                let txn = manager.begin(planned.client, TxnOptions::new());
                let mut ok = true;
                for spec in planned.specs {
                    if !txn.lock(spec).await?.is_ok() {
                        ok = false;
                        break;
                    }
                }
                if planned.hold.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(planned.hold).await;
                }
                manager.end_transaction(&txn).await?;
                Ok::<_, DlmError>(ok)
            });
        }

        let violations = Arc::new(AtomicUsize::new(0));
        let sampler = {
            let cluster = Arc::clone(&cluster);
            let violations = Arc::clone(&violations);
            tokio::spawn(async move {
                loop {
                    for host in cluster.hosts() {
                        if let Ok(snapshot) = cluster.snapshot(host).await {
                            let found = snapshot.conflicting_holders().len();
                            violations.fetch_add(found, Ordering::Relaxed);
                        }
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut report = Report::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(true)) => report.completed += 1,
                Ok(Ok(false)) => report.aborted += 1,
                Ok(Err(e)) => {
                    sampler.abort();
                    return Err(e);
                }
                Err(e) => {
                    sampler.abort();
                    return Err(DlmError::internal(e.to_string()));
                }
            }
        }
        sampler.abort();
        let _ = sampler.await;
        report.violations = violations.load(Ordering::Relaxed);

        for host in hosts {
            report.leftover_entries += cluster.snapshot(host).await?.entries.len();
        }
        Ok(report)
    }
}
