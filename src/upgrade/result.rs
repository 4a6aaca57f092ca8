//! Job result payloads
//!
//! A worker job reports back by printing one line as the last thing it
//! writes to stdout. The same types are serialized by the worker and parsed
//! here by the operator.

use serde::{Deserialize, Serialize};

use crate::upgrade::error::{Result, UpgradeError};

/// Server settings captured from the primary before the upgrade
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedConfig {
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub data_checksums: bool,
    #[serde(default)]
    pub max_prepared_transactions: i64,
}

impl CapturedConfig {
    /// initdb arguments reproducing the captured settings
    pub fn init_args(&self) -> String {
        let mut args = Vec::new();
        if !self.locale.is_empty() {
            args.push(format!("--locale={}", self.locale));
        }
        if !self.encoding.is_empty() {
            args.push(format!("--encoding={}", self.encoding));
        }
        if self.data_checksums {
            args.push("--data-checksums".to_string());
        }
        args.join(" ")
    }
}

/// Outcome of replica synchronization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// WAL position every replica has replayed, `X/Y` notation
    pub lsn: String,
    /// Converged rounds needed
    pub rounds: u32,
}

fn parse_json<T: for<'de> Deserialize<'de>>(job: &str, line: &str) -> Result<T> {
    serde_json::from_str(line).map_err(|e| UpgradeError::MalformedResult {
        job: job.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_captured_config(job: &str, line: &str) -> Result<CapturedConfig> {
    parse_json(job, line)
}

pub fn parse_sync_result(job: &str, line: &str) -> Result<SyncResult> {
    let result: SyncResult = parse_json(job, line)?;
    if !is_lsn(&result.lsn) {
        return Err(UpgradeError::MalformedResult {
            job: job.to_string(),
            reason: format!("invalid WAL position {:?}", result.lsn),
        });
    }
    Ok(result)
}

/// A PostgreSQL system identifier is an unsigned 64-bit decimal
pub fn parse_system_identifier(job: &str, line: &str) -> Result<String> {
    let id = line.trim();
    if id.is_empty() || id.parse::<u64>().is_err() {
        return Err(UpgradeError::MalformedResult {
            job: job.to_string(),
            reason: format!("expected a system identifier, got {:?}", id),
        });
    }
    Ok(id.to_string())
}

fn is_lsn(s: &str) -> bool {
    match s.split_once('/') {
        Some((hi, lo)) => {
            !hi.is_empty()
                && !lo.is_empty()
                && u32::from_str_radix(hi, 16).is_ok()
                && u32::from_str_radix(lo, 16).is_ok()
        }
        None => false,
    }
}
