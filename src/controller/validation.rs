//! Validation of PatroniPostgres specs
//!
//! Structural checks run on every pass; upgrade checks run only when
//! `spec.version` moves away from the version the data files are in.

use crate::config::ImageRegistry;
use crate::controller::error::{Error, Result};
use crate::crd::PatroniPostgres;

/// Upper bound on members, one Patroni DCS key per member
pub const MAX_NODES: usize = 32;

/// Validate the cluster spec
pub fn validate_spec(cluster: &PatroniPostgres, images: &ImageRegistry) -> Result<()> {
    validate_nodes(cluster)?;
    validate_volume_size(&cluster.spec.volume_size)?;

    if !images.supports(cluster.spec.version) {
        return Err(Error::ValidationError(format!(
            "no image ships PostgreSQL {}",
            cluster.spec.version
        )));
    }
    Ok(())
}

fn validate_nodes(cluster: &PatroniPostgres) -> Result<()> {
    let nodes = &cluster.spec.nodes;
    if nodes.is_empty() {
        return Err(Error::ValidationError(
            "at least one node is required".to_string(),
        ));
    }
    if nodes.len() > MAX_NODES {
        return Err(Error::ValidationError(format!(
            "node count {} exceeds maximum {}",
            nodes.len(),
            MAX_NODES
        )));
    }
    if nodes.iter().all(|n| n.tags.nofailover) {
        return Err(Error::ValidationError(
            "every node is tagged nofailover, no member could become leader".to_string(),
        ));
    }
    Ok(())
}

/// Quantity with a binary suffix, e.g. "10Gi"
fn validate_volume_size(size: &str) -> Result<()> {
    let digits = size
        .strip_suffix("Gi")
        .or_else(|| size.strip_suffix("Mi"))
        .or_else(|| size.strip_suffix("Ti"))
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "volume size must end with Gi, Mi, or Ti: {:?}",
                size
            ))
        })?;

    match digits.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err(Error::ValidationError(format!(
            "invalid volume size: {:?}",
            size
        ))),
    }
}

/// Validate a major version change from `current` to `target`
pub fn validate_version_upgrade(current: i32, target: i32, images: &ImageRegistry) -> Result<()> {
    if target < current {
        return Err(Error::ValidationError(format!(
            "downgrade from {} to {} is not supported",
            current, target
        )));
    }
    if images.for_upgrade(current, target).is_none() {
        return Err(Error::ValidationError(format!(
            "no image ships both PostgreSQL {} and {}",
            current, target
        )));
    }
    Ok(())
}
