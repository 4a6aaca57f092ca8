//! Process-wide operator configuration
//!
//! Built once at startup from the environment and shared read-only through
//! the controller context.

use serde::Deserialize;
use thiserror::Error;

/// Default image for upgrade worker jobs
pub const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/k-web-s/patroni-postgres-operator-upgrade:latest";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid PATRONI_IMAGES: {0}")]
    InvalidImages(#[from] serde_json::Error),

    #[error("image {0:?} lists no versions")]
    EmptyImage(String),
}

/// A database image and the PostgreSQL major versions it ships
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ImageEntry {
    pub image: String,
    pub versions: Vec<i32>,
}

/// Maps PostgreSQL major versions to database images.
///
/// Entries registered later take precedence, so the newest image shipping a
/// version is the one used to run it.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRegistry {
    entries: Vec<ImageEntry>,
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                ImageEntry {
                    image: "ghcr.io/rkojedzinszky/postgres-patroni:20251017".to_string(),
                    versions: vec![13, 15],
                },
                ImageEntry {
                    image: "ghcr.io/rkojedzinszky/postgres-patroni:20251018".to_string(),
                    versions: vec![15, 17],
                },
            ],
        }
    }
}

impl ImageRegistry {
    pub fn new(entries: Vec<ImageEntry>) -> Self {
        Self { entries }
    }

    /// Parse a JSON list of `{"image": .., "versions": [..]}` objects
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let entries: Vec<ImageEntry> = serde_json::from_str(spec)?;
        if let Some(empty) = entries.iter().find(|e| e.versions.is_empty()) {
            return Err(ConfigError::EmptyImage(empty.image.clone()));
        }
        Ok(Self { entries })
    }

    /// Image running the given major version
    pub fn for_version(&self, version: i32) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.versions.contains(&version))
            .map(|e| e.image.as_str())
    }

    /// Image shipping both the old and the new binaries of an upgrade
    pub fn for_upgrade(&self, from: i32, to: i32) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.versions.contains(&from) && e.versions.contains(&to))
            .map(|e| e.image.as_str())
    }

    pub fn supports(&self, version: i32) -> bool {
        self.for_version(version).is_some()
    }
}

/// Operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image for capture-config, replica-sync and post-upgrade jobs
    pub worker_image: String,
    pub images: ImageRegistry,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            images: ImageRegistry::default(),
        }
    }
}

impl OperatorConfig {
    /// Read `UPGRADE_WORKER_IMAGE` and `PATRONI_IMAGES`
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_image = std::env::var("UPGRADE_WORKER_IMAGE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string());

        let images = match std::env::var("PATRONI_IMAGES") {
            Ok(spec) if !spec.trim().is_empty() => ImageRegistry::parse(&spec)?,
            _ => ImageRegistry::default(),
        };

        Ok(Self {
            worker_image,
            images,
        })
    }
}
