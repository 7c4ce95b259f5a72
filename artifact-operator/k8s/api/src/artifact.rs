use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use kyverno_artifact_operator_core::Provider;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Every worker pod is named `kyverno-artifact-manager-<artifact name>`.
pub const WORKER_POD_PREFIX: &str = "kyverno-artifact-manager-";

pub fn worker_pod_name(artifact_name: &str) -> String {
    format!("{WORKER_POD_PREFIX}{artifact_name}")
}

/// Declares a remote OCI artifact whose YAML layers should be synchronized
/// into the cluster.
///
/// Optional fields stay `None` when the user leaves them unset; defaults are
/// applied by the controller and worker, never at deserialization time.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kyverno.octokode.io",
    version = "v1alpha1",
    kind = "KyvernoArtifact",
    namespaced,
    status = "KyvernoArtifactStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KyvernoArtifactSpec {
    /// Location of the artifact, e.g. `ghcr.io/acme/policies:latest`.
    pub url: Option<String>,
    /// Artifact type. Only `oci` is supported.
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    /// `github` or `artifactory`.
    pub provider: Option<String>,
    /// Seconds between registry polls.
    pub polling_interval: Option<i32>,
    pub delete_policies_on_termination: Option<bool>,
    pub reconcile_policies_from_checksum: Option<bool>,
    pub poll_for_tag_changes: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KyvernoArtifactStatus {
    /// Conditions keyed by `type`: `Available`, `Progressing`, `Degraded`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl KyvernoArtifact {
    pub fn worker_pod_name(&self) -> String {
        worker_pod_name(&self.name_any())
    }

    pub fn url(&self) -> Option<&str> {
        self.spec.url.as_deref().filter(|url| !url.is_empty())
    }

    /// Declared provider, defaulting to GitHub. An unknown provider string is
    /// passed through verbatim to the worker, which rejects it at startup.
    pub fn provider_name(&self) -> &str {
        match self.spec.provider.as_deref() {
            Some(provider) if !provider.is_empty() => provider,
            _ => Provider::Github.as_str(),
        }
    }

    /// Declared polling interval, defaulting to 60 seconds.
    pub fn polling_interval(&self) -> i32 {
        self.spec.polling_interval.unwrap_or(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(spec: KyvernoArtifactSpec) -> KyvernoArtifact {
        KyvernoArtifact::new("alpha", spec)
    }

    fn empty_spec() -> KyvernoArtifactSpec {
        KyvernoArtifactSpec {
            url: None,
            artifact_type: None,
            provider: None,
            polling_interval: None,
            delete_policies_on_termination: None,
            reconcile_policies_from_checksum: None,
            poll_for_tag_changes: None,
        }
    }

    #[test]
    fn worker_pod_name_is_deterministic() {
        assert_eq!(
            artifact(empty_spec()).worker_pod_name(),
            "kyverno-artifact-manager-alpha"
        );
    }

    #[test]
    fn defaults_apply_only_when_unset() {
        let unset = artifact(empty_spec());
        assert_eq!(unset.provider_name(), "github");
        assert_eq!(unset.polling_interval(), 60);

        let zero = artifact(KyvernoArtifactSpec {
            polling_interval: Some(0),
            provider: Some("artifactory".into()),
            ..empty_spec()
        });
        assert_eq!(zero.polling_interval(), 0);
        assert_eq!(zero.provider_name(), "artifactory");
    }

    #[test]
    fn empty_url_reads_as_unset() {
        let blank = artifact(KyvernoArtifactSpec {
            url: Some(String::new()),
            ..empty_spec()
        });
        assert_eq!(blank.url(), None);
    }

    #[test]
    fn spec_fields_use_wire_names() {
        let json = serde_json::json!({
            "url": "ghcr.io/acme/pol",
            "type": "oci",
            "pollingInterval": 120,
            "pollForTagChanges": false,
        });
        let spec: KyvernoArtifactSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.artifact_type.as_deref(), Some("oci"));
        assert_eq!(spec.polling_interval, Some(120));
        assert_eq!(spec.poll_for_tag_changes, Some(false));
        assert_eq!(spec.delete_policies_on_termination, None);
    }
}
