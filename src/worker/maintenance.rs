//! Post-upgrade maintenance
//!
//! pg_upgrade carries neither planner statistics nor extension upgrades over.
//! Extensions are updated in all databases concurrently, then every database
//! is analyzed in turn.

use futures::future::join_all;
use serde_json::json;
use tracing::info;

use super::connect::{ConnectParams, connect, connect_primary};
use super::{Result, WorkerError};

async fn databases(params: &ConnectParams) -> Result<Vec<String>> {
    let client = connect_primary(params).await?;
    let rows = client
        .query(
            "SELECT datname::text FROM pg_catalog.pg_database WHERE datallowconn ORDER BY datname",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn update_extensions(params: &ConnectParams, database: &str) -> Result<usize> {
    let wrap = |source| WorkerError::ExtensionUpdate {
        database: database.to_string(),
        source,
    };

    let client = connect(&params.with_dbname(database)).await.map_err(wrap)?;
    let rows = client
        .query("SELECT quote_ident(extname) FROM pg_catalog.pg_extension", &[])
        .await
        .map_err(wrap)?;
    let extensions: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

    for extension in &extensions {
        client
            .batch_execute(&format!("ALTER EXTENSION {} UPDATE", extension))
            .await
            .map_err(wrap)?;
    }
    Ok(extensions.len())
}

async fn analyze(params: &ConnectParams, database: &str) -> Result<()> {
    info!(database, "running ANALYZE");
    let client = connect(&params.with_dbname(database)).await?;
    client.batch_execute("ANALYZE").await?;
    Ok(())
}

pub async fn run(params: &ConnectParams) -> Result<String> {
    let databases = databases(params).await?;

    let updates = join_all(databases.iter().map(|db| update_extensions(params, db))).await;
    let mut extensions = 0;
    for updated in updates {
        extensions += updated?;
    }
    info!(databases = databases.len(), extensions, "extensions updated");

    for database in &databases {
        analyze(params, database).await?;
    }

    Ok(json!({ "databases": databases.len(), "extensions": extensions }).to_string())
}
