use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kyverno_artifact_operator_core::{Manifest, PolicyLabels};

/// Walks a pulled directory, stamps tracking labels onto every YAML manifest,
/// and returns the `file → fingerprint` map. Files that do not parse as a
/// single manifest are left untouched and skipped with a warning.
pub fn annotate_dir(
    dir: &Path,
    labels: &PolicyLabels,
) -> std::io::Result<BTreeMap<PathBuf, String>> {
    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files)?;

    let mut fingerprints = BTreeMap::new();
    for path in files {
        match annotate_file(&path, labels) {
            Ok(fingerprint) => {
                fingerprints.insert(path, fingerprint);
            }
            Err(error) => {
                tracing::warn!(file = %path.display(), %error, "skipping manifest");
            }
        }
    }
    Ok(fingerprints)
}

fn annotate_file(path: &Path, labels: &PolicyLabels) -> anyhow::Result<String> {
    let raw = std::fs::read(path)?;
    let text = std::str::from_utf8(&raw)?;
    let mut manifest = Manifest::parse_yaml(text)?;

    // The fingerprint is taken before stamping: the labels live under
    // metadata and must not feed into the content identity.
    let fingerprint = manifest.fingerprint(&raw);
    manifest.stamp_labels(labels, &fingerprint);
    std::fs::write(path, manifest.to_yaml()?)?;
    Ok(fingerprint)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if is_yaml(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyverno_artifact_operator_core::{labels, spec_fingerprint};
    use serde_json::Value;

    const POLICY: &str = r#"apiVersion: kyverno.io/v1
kind: ClusterPolicy
metadata:
  name: require-labels
spec:
  rules:
    - name: check-team
"#;

    fn stamp() -> PolicyLabels {
        PolicyLabels {
            tag: "v2".into(),
            artifact_name: Some("alpha".into()),
        }
    }

    #[test]
    fn annotates_and_fingerprints_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy.yaml");
        std::fs::write(&file, POLICY).unwrap();

        let fingerprints = annotate_dir(dir.path(), &stamp()).unwrap();
        assert_eq!(fingerprints.len(), 1);

        let value: Value = serde_yaml::from_str(POLICY).unwrap();
        assert_eq!(
            fingerprints[&file],
            spec_fingerprint(value.get("spec").unwrap())
        );

        let rewritten = Manifest::parse_yaml(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(rewritten.label(labels::POLICY_VERSION), Some("v2"));
        assert_eq!(rewritten.label(labels::ARTIFACT_NAME), Some("alpha"));
        assert_eq!(
            rewritten.label(labels::POLICY_CHECKSUM),
            Some(fingerprints[&file].as_str())
        );
    }

    #[test]
    fn walks_nested_directories_and_both_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("one.yml"), POLICY).unwrap();
        std::fs::write(dir.path().join("two.yaml"), POLICY).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), POLICY).unwrap();

        let fingerprints = annotate_dir(dir.path(), &stamp()).unwrap();
        assert_eq!(fingerprints.len(), 2);
    }

    #[test]
    fn unparseable_files_are_skipped_and_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("broken.yaml");
        std::fs::write(&bad, ": not yaml: [").unwrap();
        std::fs::write(dir.path().join("good.yaml"), POLICY).unwrap();

        let fingerprints = annotate_dir(dir.path(), &stamp()).unwrap();
        assert_eq!(fingerprints.len(), 1);
        assert!(!fingerprints.contains_key(&bad));
        assert_eq!(std::fs::read_to_string(&bad).unwrap(), ": not yaml: [");
    }

    #[test]
    fn identical_content_yields_identical_maps() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        for dir in [&dir_a, &dir_b] {
            std::fs::write(dir.path().join("policy.yaml"), POLICY).unwrap();
        }

        let a = annotate_dir(dir_a.path(), &stamp()).unwrap();
        let b = annotate_dir(dir_b.path(), &stamp()).unwrap();
        let checksums_a: Vec<_> = a.values().collect();
        let checksums_b: Vec<_> = b.values().collect();
        assert_eq!(checksums_a, checksums_b);
    }

    #[test]
    fn manifests_without_spec_fall_back_to_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n";
        std::fs::write(dir.path().join("cm.yaml"), raw).unwrap();

        let fingerprints = annotate_dir(dir.path(), &stamp()).unwrap();
        let fingerprint = fingerprints.values().next().unwrap();
        assert_eq!(
            fingerprint,
            &kyverno_artifact_operator_core::fingerprint_bytes(raw.as_bytes())
        );
    }
}
