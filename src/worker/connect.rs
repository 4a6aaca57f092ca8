//! Database connections with bounded retries
//!
//! Pods are restarted and Services re-pointed all through an upgrade, so a
//! refused connection is normal for a few seconds. Every connection attempt
//! uses a short timeout and is retried a fixed number of times.

use std::time::Duration;

use thiserror::Error;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, trace};

/// Timeout of a single connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Attempts after the first failed one
pub const CONNECT_RETRIES: u32 = 10;

/// Pause between attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("No primary reachable through {0}")]
    NoPrimary(String),
}

#[derive(Clone, Debug)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl ConnectParams {
    /// Same credentials against another host
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }

    /// Same credentials against another database
    pub fn with_dbname(&self, dbname: impl Into<String>) -> Self {
        Self {
            dbname: dbname.into(),
            ..self.clone()
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("upgrade-worker")
            .connect_timeout(CONNECT_TIMEOUT);
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

async fn connect_once(config: &Config) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!(error = %e, "PostgreSQL connection closed");
        }
    });
    Ok(client)
}

/// Connect, retrying failed attempts
pub async fn connect(params: &ConnectParams) -> Result<Client, tokio_postgres::Error> {
    let config = params.config();
    let mut retries = CONNECT_RETRIES;
    loop {
        match connect_once(&config).await {
            Ok(client) => return Ok(client),
            Err(e) if retries > 0 => {
                debug!(host = %params.host, error = %e, retries, "connection failed, retrying");
                retries -= 1;
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connect to whichever member currently accepts writes
///
/// The Service may briefly route to a replica during a switchover; such
/// connections are dropped and the attempt repeated.
pub async fn connect_primary(params: &ConnectParams) -> Result<Client, ConnectError> {
    for _ in 0..=CONNECT_RETRIES {
        let client = connect(params).await?;
        let row = client.query_one("SELECT pg_is_in_recovery()", &[]).await?;
        let in_recovery: bool = row.get(0);
        if !in_recovery {
            return Ok(client);
        }
        debug!(host = %params.host, "connected to a replica, retrying for the primary");
        drop(client);
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
    Err(ConnectError::NoPrimary(params.host.clone()))
}
