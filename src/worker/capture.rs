//! Capture the primary's initialization settings

use tracing::info;

use super::Result;
use super::connect::{ConnectParams, connect_primary};
use crate::upgrade::result::CapturedConfig;

pub async fn run(params: &ConnectParams) -> Result<String> {
    let client = connect_primary(params).await?;

    // lc_collate is no longer a setting from 16 on; the catalog has it for all versions
    let locale: String = client
        .query_one(
            "SELECT datcollate::text FROM pg_catalog.pg_database WHERE datname = current_database()",
            &[],
        )
        .await?
        .get(0);
    let encoding: String = client.query_one("SHOW server_encoding", &[]).await?.get(0);
    let row = client
        .query_one(
            "SELECT pg_catalog.current_setting('data_checksums')::bool, \
             pg_catalog.current_setting('max_prepared_transactions')::bigint",
            &[],
        )
        .await?;

    let config = CapturedConfig {
        locale,
        encoding,
        data_checksums: row.get(0),
        max_prepared_transactions: row.get(1),
    };
    info!(
        locale = %config.locale,
        encoding = %config.encoding,
        data_checksums = config.data_checksums,
        max_prepared_transactions = config.max_prepared_transactions,
        "captured primary settings"
    );

    Ok(serde_json::to_string(&config)?)
}
