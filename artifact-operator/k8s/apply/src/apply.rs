use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kube::api::{DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::Scope;
use kube::{Api, Client, ResourceExt};
use kyverno_artifact_operator_core::{Manifest, ManifestError};
use serde::Deserialize;

use crate::scope::ScopeLookup;

/// Splits a YAML stream (`---`-separated) into manifests. Empty documents
/// (null or without keys) are skipped silently; any malformed document fails
/// the whole file.
pub fn parse_documents(data: &str) -> Result<Vec<Manifest>, ManifestError> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_json::Value::deserialize(document)?;
        match &value {
            serde_json::Value::Null => continue,
            serde_json::Value::Object(map) if map.is_empty() => continue,
            _ => {}
        }
        manifests.push(Manifest::from_value(value)?);
    }
    Ok(manifests)
}

/// Applies manifests through the dynamic API with optimistic concurrency:
/// absent objects are created, existing objects are replaced at the fetched
/// resourceVersion.
pub struct Applier<S> {
    client: Client,
    scopes: S,
}

impl<S: ScopeLookup> Applier<S> {
    pub fn new(client: Client, scopes: S) -> Self {
        Self { client, scopes }
    }

    /// Applies every document in a file. The file as a whole either parses or
    /// is rejected; failures applying one document abort the file so the
    /// caller can log it and move on to the next one.
    pub async fn apply_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let manifests = parse_documents(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        for manifest in manifests {
            self.apply_manifest(manifest).await?;
        }
        Ok(())
    }

    pub async fn apply_manifest(&self, mut manifest: Manifest) -> Result<()> {
        let (api, _) = self.api_for(&mut manifest)?;

        let object: DynamicObject = serde_json::from_value(manifest.into_value())
            .context("manifest is not a valid Kubernetes object")?;
        let name = object.name_any();

        match api.get_opt(&name).await? {
            None => {
                api.create(&PostParams::default(), &object).await?;
                tracing::info!(%name, "created");
            }
            Some(existing) => {
                let mut object = object;
                object.metadata.resource_version = existing.resource_version();
                api.replace(&name, &PostParams::default(), &object).await?;
                tracing::info!(%name, "updated");
            }
        }
        Ok(())
    }

    /// Fetches the live counterpart of a manifest, if any. Used by the
    /// checksum reconciler.
    pub(crate) async fn get_existing(
        &self,
        manifest: &mut Manifest,
    ) -> Result<Option<DynamicObject>> {
        let (api, name) = self.api_for(manifest)?;
        Ok(api.get_opt(&name).await?)
    }

    /// Resolves scope and builds the right dynamic API handle. Cluster-scoped
    /// manifests authored with a namespace have the namespace stripped.
    fn api_for(&self, manifest: &mut Manifest) -> Result<(Api<DynamicObject>, String)> {
        let (group, version) = manifest.group_version();
        let gvk = GroupVersionKind::gvk(group, version, manifest.kind());
        let (resource, scope) = self.scopes.resolve(&gvk).ok_or_else(|| {
            anyhow!(
                "no server mapping for {}/{} {} (is the CRD installed?)",
                gvk.group,
                gvk.version,
                gvk.kind
            )
        })?;

        if matches!(scope, Scope::Cluster) {
            if let Some(namespace) = manifest.namespace() {
                tracing::warn!(
                    kind = %manifest.kind(),
                    name = %manifest.name(),
                    %namespace,
                    "cluster-scoped object carries a namespace, removing it"
                );
                manifest.clear_namespace();
            }
        }

        let name = manifest.name().to_string();
        let api = match (&scope, manifest.namespace()) {
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            (Scope::Namespaced, None) => {
                Api::default_namespaced_with(self.client.clone(), &resource)
            }
        };
        Ok((api, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multi_document_streams() {
        let stream = r#"
apiVersion: kyverno.io/v1
kind: Policy
metadata:
  name: first
  namespace: default
---
apiVersion: kyverno.io/v1
kind: ClusterPolicy
metadata:
  name: second
"#;
        let manifests = parse_documents(stream).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].name(), "first");
        assert_eq!(manifests[1].kind(), "ClusterPolicy");
    }

    #[test]
    fn empty_documents_are_skipped_silently() {
        let stream = "---\n# just a comment\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n---\n";
        let manifests = parse_documents(stream).unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].name(), "cm");
    }

    #[test]
    fn a_malformed_document_fails_the_file() {
        let stream = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n---\nkind: Mystery\n";
        assert!(parse_documents(stream).is_err());
    }

    #[test]
    fn an_empty_file_yields_no_manifests() {
        assert!(parse_documents("").unwrap().is_empty());
    }
}
