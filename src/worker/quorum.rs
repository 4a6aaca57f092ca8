//! Replication quorum synchronization
//!
//! Before the members are stopped every replica has to have replayed the
//! primary's WAL up to one common position. Writes may still trickle in while
//! this runs, so the position is re-read after each converged round and the
//! loop only ends once a round finishes without the primary moving on.
//!
//! ```text
//! checkpoint primary ─▶ L0
//!   ┌─▶ replicas with replay_lsn ≥ L0 (per pg_stat_replication)
//!   │   confirm each replica directly, concurrently, with a timeout
//!   │   all confirmed? ── no ─▶ sleep, checkpoint primary, new L0 ─┐
//!   │        │ yes                                                 │
//!   │   L1 = primary position; L1 == L0? ── yes ─▶ done            │
//!   └────────┴ no: L0 = L1 ◀───────────────────────────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::connect::{self, ConnectError, ConnectParams};

/// Default pause between rounds that did not converge
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on confirming a single replica
pub const DEFAULT_REPLICA_TIMEOUT: Duration = Duration::from_secs(5);

/// A write-ahead log position
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidLsn(s.to_string());
        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Invalid WAL position: {0:?}")]
    InvalidLsn(String),

    #[error("Replicas did not converge within {rounds} rounds")]
    NotConverged { rounds: u32 },
}

/// Result of a completed synchronization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Position every replica has replayed and the primary has not moved past
    pub lsn: Lsn,
    /// Rounds run, converged or not
    pub rounds: u32,
}

/// The primary and replicas being synchronized
pub trait SyncTarget: Send + Sync {
    /// Checkpoint the primary and return its current WAL position
    fn checkpoint_primary(&self) -> impl Future<Output = Result<Lsn, SyncError>> + Send;

    /// Current WAL position of the primary
    fn primary_lsn(&self) -> impl Future<Output = Result<Lsn, SyncError>> + Send;

    /// Addresses of the expected members the primary reports as having
    /// replayed `lsn`
    fn caught_up_replicas(
        &self,
        lsn: Lsn,
    ) -> impl Future<Output = Result<Vec<String>, SyncError>> + Send;

    /// Check on the replica itself that it has replayed `lsn`, and checkpoint
    /// it when it has
    fn confirm_replica(
        &self,
        address: &str,
        lsn: Lsn,
    ) -> impl Future<Output = Result<bool, SyncError>> + Send;
}

#[derive(Clone, Debug)]
pub struct QuorumSynchronizer {
    replicas: usize,
    poll_interval: Duration,
    replica_timeout: Duration,
    max_rounds: Option<u32>,
}

impl QuorumSynchronizer {
    /// Synchronizer waiting for `replicas` members besides the primary
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            poll_interval: DEFAULT_POLL_INTERVAL,
            replica_timeout: DEFAULT_REPLICA_TIMEOUT,
            max_rounds: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_replica_timeout(mut self, timeout: Duration) -> Self {
        self.replica_timeout = timeout;
        self
    }

    /// Give up after `rounds`; unbounded by default, leaving the limit to
    /// the job deadline
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub async fn run<T: SyncTarget>(&self, target: &T) -> Result<SyncOutcome, SyncError> {
        if self.replicas == 0 {
            let lsn = target.primary_lsn().await?;
            return Ok(SyncOutcome { lsn, rounds: 0 });
        }

        let mut lsn = target.checkpoint_primary().await?;
        let mut rounds = 0;
        loop {
            if self.max_rounds.is_some_and(|max| rounds >= max) {
                return Err(SyncError::NotConverged { rounds });
            }
            rounds += 1;

            let confirmed = self.round(target, lsn).await?;
            if confirmed < self.replicas {
                debug!(%lsn, confirmed, expected = self.replicas, rounds, "replicas behind");
                tokio::time::sleep(self.poll_interval).await;
                lsn = target.checkpoint_primary().await?;
                continue;
            }

            let current = target.primary_lsn().await?;
            if current == lsn {
                info!(%lsn, rounds, "replicas converged");
                return Ok(SyncOutcome { lsn, rounds });
            }
            debug!(from = %lsn, to = %current, rounds, "primary moved on during round");
            lsn = current;
        }
    }

    /// Number of replicas confirmed at `lsn`
    async fn round<T: SyncTarget>(&self, target: &T, lsn: Lsn) -> Result<usize, SyncError> {
        let addresses = target.caught_up_replicas(lsn).await?;
        if addresses.len() < self.replicas {
            return Ok(0);
        }

        let checks = addresses.iter().map(|address| async move {
            match tokio::time::timeout(self.replica_timeout, target.confirm_replica(address, lsn))
                .await
            {
                Ok(Ok(true)) => true,
                Ok(Ok(false)) => {
                    debug!(replica = %address, %lsn, "replica still replaying");
                    false
                }
                Ok(Err(e)) => {
                    warn!(replica = %address, error = %e, "replica check failed");
                    false
                }
                Err(_) => {
                    warn!(replica = %address, "replica check timed out");
                    false
                }
            }
        });

        Ok(join_all(checks).await.into_iter().filter(|ok| *ok).count())
    }
}

/// Live cluster reached through the primary's Service
pub struct PostgresTarget {
    primary: Client,
    params: ConnectParams,
    members: Vec<String>,
}

impl PostgresTarget {
    pub async fn connect(params: ConnectParams, members: Vec<String>) -> Result<Self, SyncError> {
        let primary = connect::connect_primary(&params).await?;
        Ok(Self {
            primary,
            params,
            members,
        })
    }

    async fn current_lsn(&self) -> Result<Lsn, SyncError> {
        let row = self
            .primary
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        row.get::<_, String>(0).parse()
    }
}

impl SyncTarget for PostgresTarget {
    async fn checkpoint_primary(&self) -> Result<Lsn, SyncError> {
        self.primary.batch_execute("CHECKPOINT").await?;
        self.current_lsn().await
    }

    async fn primary_lsn(&self) -> Result<Lsn, SyncError> {
        self.current_lsn().await
    }

    async fn caught_up_replicas(&self, lsn: Lsn) -> Result<Vec<String>, SyncError> {
        let rows = self
            .primary
            .query(
                "SELECT host(client_addr) FROM pg_catalog.pg_stat_replication \
                 WHERE application_name = ANY($1) AND replay_lsn >= $2::text::pg_lsn",
                &[&self.members, &lsn.to_string()],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<_, Option<String>>(0))
            .collect())
    }

    async fn confirm_replica(&self, address: &str, lsn: Lsn) -> Result<bool, SyncError> {
        let client = connect::connect(&self.params.with_host(address)).await?;
        let row = client
            .query_one(
                "SELECT pg_wal_lsn_diff($1::text::pg_lsn, pg_last_wal_replay_lsn())::bigint",
                &[&lsn.to_string()],
            )
            .await?;
        let behind: Option<i64> = row.get(0);
        if behind.is_none_or(|bytes| bytes > 0) {
            return Ok(false);
        }
        // Bounds recovery time when the replica restarts
        client.batch_execute("CHECKPOINT").await?;
        Ok(true)
    }
}
