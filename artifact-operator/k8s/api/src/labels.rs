use std::collections::BTreeMap;

pub const APP_NAME: &str = "kyverno-artifact-watcher";
pub const MANAGED_BY: &str = "kyverno-artifact-operator";
pub const COMPONENT: &str = "watcher";

/// The standard labels carried by every worker pod. The worker's startup
/// self-reconciliation sweep selects siblings on these.
pub fn watcher_pod_labels(artifact_name: &str) -> BTreeMap<String, String> {
    [
        ("app.kubernetes.io/name", APP_NAME),
        ("app.kubernetes.io/instance", artifact_name),
        ("app.kubernetes.io/managed-by", MANAGED_BY),
        ("app.kubernetes.io/component", COMPONENT),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Selector matching watcher pods of every instance.
pub fn watcher_selector() -> String {
    format!(
        "app.kubernetes.io/name={APP_NAME},app.kubernetes.io/managed-by={MANAGED_BY},app.kubernetes.io/component={COMPONENT}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_label_carries_the_artifact_name() {
        let labels = watcher_pod_labels("alpha");
        assert_eq!(labels.len(), 4);
        assert_eq!(labels["app.kubernetes.io/instance"], "alpha");
        assert_eq!(labels["app.kubernetes.io/name"], APP_NAME);
    }

    #[test]
    fn selector_is_instance_agnostic() {
        assert!(!watcher_selector().contains("instance"));
    }
}
