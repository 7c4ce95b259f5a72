use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use kyverno_artifact_operator_core::{spec_fingerprint, Manifest};
use serde_json::Value;

use crate::apply::Applier;
use crate::scope::ScopeLookup;

/// Result of comparing freshly pulled manifests against the cluster.
#[derive(Debug, Default)]
pub struct ChecksumDiff {
    pub changed: bool,
    pub files: Vec<PathBuf>,
}

/// True when the existing object's `spec` fingerprint matches the freshly
/// pulled one. A missing `spec` never matches.
fn spec_matches(existing_spec: Option<&Value>, expected: &str) -> bool {
    match existing_spec {
        Some(spec) => spec_fingerprint(spec) == expected,
        None => false,
    }
}

impl<S: ScopeLookup> Applier<S> {
    /// Walks the pulled `file → fingerprint` map and collects the files whose
    /// in-cluster counterpart is missing or diverges. Fetch and parse
    /// problems skip the file without marking the set changed.
    pub async fn changed_files(
        &self,
        fingerprints: &BTreeMap<PathBuf, String>,
    ) -> Result<ChecksumDiff> {
        let mut diff = ChecksumDiff::default();

        for (file, fingerprint) in fingerprints {
            match self.file_needs_apply(file, fingerprint).await {
                Ok(true) => {
                    diff.changed = true;
                    diff.files.push(file.clone());
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(file = %file.display(), %error, "skipping checksum comparison");
                }
            }
        }

        Ok(diff)
    }

    async fn file_needs_apply(&self, file: &Path, fingerprint: &str) -> Result<bool> {
        let data = std::fs::read_to_string(file)?;
        let mut manifest = Manifest::parse_yaml(&data)?;

        let existing = match self.get_existing(&mut manifest).await? {
            Some(existing) => existing,
            None => {
                tracing::info!(
                    kind = %manifest.kind(),
                    name = %manifest.name(),
                    "not found in cluster, scheduling apply"
                );
                return Ok(true);
            }
        };

        if spec_matches(existing.data.get("spec"), fingerprint) {
            tracing::debug!(
                kind = %manifest.kind(),
                name = %manifest.name(),
                checksum = %fingerprint,
                "unchanged"
            );
            Ok(false)
        } else {
            tracing::info!(
                kind = %manifest.kind(),
                name = %manifest.name(),
                checksum = %fingerprint,
                "content changed, scheduling apply"
            );
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matching_fingerprints_skip_the_file() {
        let spec = json!({"rules": [{"name": "r1"}]});
        let fingerprint = spec_fingerprint(&spec);
        assert!(spec_matches(Some(&spec), &fingerprint));
    }

    #[test]
    fn divergent_specs_are_flagged() {
        let spec = json!({"rules": [{"name": "r1"}]});
        let other = json!({"rules": [{"name": "r2"}]});
        assert!(!spec_matches(Some(&other), &spec_fingerprint(&spec)));
    }

    #[test]
    fn a_missing_spec_is_treated_as_a_mismatch() {
        assert!(!spec_matches(None, "anything"));
    }
}
