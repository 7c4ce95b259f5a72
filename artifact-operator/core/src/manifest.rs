use serde_json::{Map, Value};

use crate::fingerprint::{fingerprint_bytes, spec_fingerprint};

/// Labels stamped onto every manifest the watcher applies. The garbage
/// collector and termination cleanup select on the same keys.
pub mod labels {
    pub const MANAGED_BY_KEY: &str = "managed-by";
    pub const MANAGED_BY_VALUE: &str = "kyverno-watcher";
    pub const POLICY_VERSION: &str = "policy-version";
    pub const ARTIFACT_NAME: &str = "artifact-name";
    pub const POLICY_CHECKSUM: &str = "policy-checksum";

    /// Selector matching every object this system manages.
    pub fn managed_selector() -> String {
        format!("{MANAGED_BY_KEY}={MANAGED_BY_VALUE}")
    }

    /// Selector matching the objects applied on behalf of one declared
    /// artifact.
    pub fn artifact_selector(artifact_name: &str) -> String {
        format!("{ARTIFACT_NAME}={artifact_name}")
    }
}

/// Tracking labels for one pulled artifact version.
#[derive(Clone, Debug)]
pub struct PolicyLabels {
    pub tag: String,
    pub artifact_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("manifest is not a mapping")]
    NotAnObject,
    #[error("manifest is missing {0}")]
    MissingField(&'static str),
}

/// A single parsed YAML object destined for the cluster.
///
/// The full document is retained as a JSON value so that re-serializing after
/// label stamping preserves fields this system does not interpret.
#[derive(Clone, Debug)]
pub struct Manifest {
    value: Value,
}

impl Manifest {
    /// Parses a single-document YAML manifest. The document must be a mapping
    /// with `apiVersion`, `kind`, and `metadata.name`.
    pub fn parse_yaml(data: &str) -> Result<Self, ManifestError> {
        let value: Value = serde_yaml::from_str(data)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        if !value.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let manifest = Self { value };
        if manifest.str_field(&["apiVersion"]).is_none() {
            return Err(ManifestError::MissingField("apiVersion"));
        }
        if manifest.str_field(&["kind"]).is_none() {
            return Err(ManifestError::MissingField("kind"));
        }
        if manifest.str_field(&["metadata", "name"]).is_none() {
            return Err(ManifestError::MissingField("metadata.name"));
        }
        Ok(manifest)
    }

    pub fn api_version(&self) -> &str {
        self.str_field(&["apiVersion"]).unwrap_or_default()
    }

    /// Splits `apiVersion` into an API group and version. Core-group objects
    /// (`v1`) have an empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version().split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()),
        }
    }

    pub fn kind(&self) -> &str {
        self.str_field(&["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_field(&["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_field(&["metadata", "namespace"])
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.str_field(&["metadata", "labels", key])
    }

    pub fn spec(&self) -> Option<&Value> {
        self.value.get("spec")
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// The manifest fingerprint: canonical JSON of the `spec` subtree, or the
    /// raw file bytes when no `spec` is present.
    pub fn fingerprint(&self, raw: &[u8]) -> String {
        match self.spec() {
            Some(spec) => spec_fingerprint(spec),
            None => fingerprint_bytes(raw),
        }
    }

    /// Merges the tracking labels into `metadata.labels`, leaving unrelated
    /// labels in place. `artifact-name` is stamped only when known. A
    /// `labels: null` mapping (an empty `labels:` key in YAML) is replaced
    /// with an object.
    pub fn stamp_labels(&mut self, stamp: &PolicyLabels, checksum: &str) {
        let metadata = self
            .value
            .as_object_mut()
            .expect("validated as an object at construction")
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(metadata) = metadata.as_object_mut() else {
            return;
        };
        let slot = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let labels = slot.as_object_mut().expect("ensured above");

        labels.insert(
            labels::MANAGED_BY_KEY.into(),
            labels::MANAGED_BY_VALUE.into(),
        );
        labels.insert(labels::POLICY_VERSION.into(), stamp.tag.clone().into());
        if let Some(artifact) = &stamp.artifact_name {
            labels.insert(labels::ARTIFACT_NAME.into(), artifact.clone().into());
        }
        labels.insert(labels::POLICY_CHECKSUM.into(), checksum.into());
    }

    /// Drops `metadata.namespace`, used when a cluster-scoped kind was
    /// authored with a namespace field.
    pub fn clear_namespace(&mut self) {
        if let Some(metadata) = self.value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("namespace");
        }
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(&self.value)?)
    }

    fn str_field(&self, path: &[&str]) -> Option<&str> {
        let mut cursor = &self.value;
        for segment in path {
            cursor = cursor.get(segment)?;
        }
        cursor.as_str()
    }
}
