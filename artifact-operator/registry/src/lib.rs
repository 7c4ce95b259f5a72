//! Registry access for the worker: tag discovery and artifact pulls against
//! GitHub Container Registry and Artifactory Docker registries, plus the
//! manifest processor that fingerprints and labels pulled files.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod artifactory;
mod error;
pub mod github;
pub mod processor;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kyverno_artifact_operator_core::PolicyLabels;

pub use self::artifactory::ArtifactoryClient;
pub use self::error::RegistryError;
pub use self::github::{GhcrClient, OwnerType};

/// Media type of a Kyverno policy layer inside an OCI artifact.
pub const POLICY_LAYER_MEDIA_TYPE: &str = "application/vnd.cncf.kyverno.policy.layer.v1+yaml";

/// One registry variant. `latest_tag` answers "what should the cluster be
/// running"; `fetch` materializes one tag's layers as files under `dest`.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// The newest tag the registry advertises, or `None` when the package has
    /// no versions at all.
    async fn latest_tag(&self) -> Result<Option<String>, RegistryError>;

    /// Downloads the artifact at `tag` into `dest`, which already exists and
    /// is empty.
    async fn fetch(&self, tag: &str, dest: &Path) -> Result<(), RegistryError>;
}

/// The full pull pipeline: recreate the scratch directory, fetch the layers,
/// then fingerprint and label every YAML manifest found.
pub async fn pull(
    client: &dyn RegistryClient,
    tag: &str,
    dest: &Path,
    labels: &PolicyLabels,
) -> Result<BTreeMap<PathBuf, String>, RegistryError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    client.fetch(tag, dest).await?;

    Ok(processor::annotate_dir(dest, labels)?)
}
