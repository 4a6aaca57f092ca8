//! Upgrade worker
//!
//! Runs inside the short-lived jobs created by the upgrade pipeline. Each run
//! performs one mode against the cluster's database and prints exactly one
//! result line on stdout; all logging goes to stderr.

pub mod capture;
pub mod connect;
pub mod maintenance;
pub mod patroni;
pub mod quorum;

use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use tracing::info;

pub use connect::{ConnectError, ConnectParams};
pub use quorum::{Lsn, QuorumSynchronizer, SyncError, SyncOutcome};

/// What the worker does in this run
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WorkerMode {
    /// Read the settings the new cluster must be initialized with
    CaptureConfig,
    /// Wait for every replica to replay the primary's WAL
    ReplicaSync,
    /// Update extensions and refresh planner statistics
    PostUpgrade,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::CaptureConfig => "capture-config",
            WorkerMode::ReplicaSync => "replica-sync",
            WorkerMode::PostUpgrade => "post-upgrade",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "upgrade-worker", about = "Patroni PostgreSQL upgrade worker")]
pub struct WorkerArgs {
    /// Database host; the cluster's main Service
    #[arg(long, env = "DBHOST")]
    pub dbhost: String,

    #[arg(long, env = "DBPORT", default_value_t = 5432)]
    pub dbport: u16,

    #[arg(long, env = "DBUSER", default_value = "postgres")]
    pub dbuser: String,

    #[arg(long, env = "DBPASSWORD", hide_env_values = true, default_value = "")]
    pub dbpassword: String,

    #[arg(long, env = "DBNAME", default_value = "postgres")]
    pub dbname: String,

    #[arg(long, env = "MODE", value_enum)]
    pub mode: WorkerMode,

    /// StatefulSet name member pod names derive from
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    #[arg(long, env = "CLUSTER_SIZE", default_value_t = 0)]
    pub cluster_size: usize,

    /// Pause Patroni once replicas are synchronized
    #[arg(long, env = "PAUSE", default_value_t = false)]
    pub pause: bool,

    /// Per-replica confirmation timeout
    #[arg(long, env = "SYNC_TIMEOUT_SECONDS", default_value_t = 5)]
    pub sync_timeout_seconds: u64,

    /// Checkpoint rounds before replica synchronization gives up; unbounded
    /// when unset
    #[arg(long, env = "SYNC_MAX_ROUNDS")]
    pub sync_max_rounds: Option<u32>,
}

impl WorkerArgs {
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.dbhost.clone(),
            port: self.dbport,
            user: self.dbuser.clone(),
            password: self.dbpassword.clone(),
            dbname: self.dbname.clone(),
        }
    }

    pub fn synchronizer(&self) -> QuorumSynchronizer {
        let synchronizer = QuorumSynchronizer::new(self.cluster_size.saturating_sub(1))
            .with_replica_timeout(Duration::from_secs(self.sync_timeout_seconds));
        match self.sync_max_rounds {
            Some(rounds) => synchronizer.with_max_rounds(rounds),
            None => synchronizer,
        }
    }

    /// Pod names of every member, `<cluster>-<idx>`
    pub fn member_names(&self) -> Vec<String> {
        (0..self.cluster_size)
            .map(|i| format!("{}-{}", self.cluster_name, i))
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Connect(#[from] connect::ConnectError),

    #[error("Replica synchronization failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Patroni API error: {0}")]
    Patroni(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extension update failed in database {database}: {source}")]
    ExtensionUpdate {
        database: String,
        source: tokio_postgres::Error,
    },
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

/// Run the selected mode; returns the result line to print
pub async fn run(args: &WorkerArgs) -> Result<String> {
    info!(mode = args.mode.as_str(), host = %args.dbhost, port = args.dbport, "upgrade worker starting");
    let params = args.connect_params();

    match args.mode {
        WorkerMode::CaptureConfig => capture::run(&params).await,
        WorkerMode::ReplicaSync => {
            let target = quorum::PostgresTarget::connect(params.clone(), args.member_names()).await?;
            let outcome = args.synchronizer().run(&target).await?;
            info!(lsn = %outcome.lsn, rounds = outcome.rounds, "replicas synchronized");

            if args.pause {
                patroni::pause(&args.dbhost).await?;
                info!("patroni paused");
            }
            Ok(serde_json::to_string(&crate::upgrade::result::SyncResult {
                lsn: outcome.lsn.to_string(),
                rounds: outcome.rounds,
            })?)
        }
        WorkerMode::PostUpgrade => maintenance::run(&params).await,
    }
}
