use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use kyverno_artifact_operator_k8s_api::labels::watcher_pod_labels;
use kyverno_artifact_operator_k8s_api::{
    set_condition, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KyvernoArtifact,
    ObjectFieldSelector, Pod, PodSpec, SecretKeySelector, Volume, VolumeMount,
};
use prometheus_client::registry::Registry;

use crate::env::{self, EnvLookup};
use crate::metrics::ControllerMetrics;

const REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Controller-side configuration, read from the environment at startup.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub watcher_image: String,
    pub service_account: String,
    pub secret_name: String,
    pub github_token_key: String,
    pub artifactory_username_key: String,
    pub artifactory_password_key: String,
}

impl ControllerConfig {
    pub fn from_env(env: &dyn EnvLookup) -> Self {
        Self {
            watcher_image: env::string_or(
                env,
                "WATCHER_IMAGE",
                "ghcr.io/octokode/kyverno-artifact-operator:latest",
            ),
            service_account: env::string_or(
                env,
                "WATCHER_SERVICE_ACCOUNT",
                "kyverno-artifact-operator-watcher",
            ),
            secret_name: env::string_or(env, "WATCHER_SECRET_NAME", "kyverno-watcher-secret"),
            github_token_key: env::string_or(env, "GITHUB_TOKEN_KEY", "github-token"),
            artifactory_username_key: env::string_or(
                env,
                "ARTIFACTORY_USERNAME_KEY",
                "artifactory-username",
            ),
            artifactory_password_key: env::string_or(
                env,
                "ARTIFACTORY_PASSWORD_KEY",
                "artifactory-password",
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("spec.url is required but not set")]
    MissingArtifactUrl,
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

struct Context {
    client: Client,
    config: ControllerConfig,
    metrics: ControllerMetrics,
}

/// Controller-mode entry point: watches declared artifacts and their owned
/// worker pods.
pub async fn run(env: &dyn EnvLookup) -> anyhow::Result<()> {
    let config = ControllerConfig::from_env(env);
    let client = Client::try_default().await?;

    // The registry is where a metrics endpoint would scrape from; serving it
    // is outside the controller core.
    let mut registry = Registry::default();
    let metrics = ControllerMetrics::register(&mut registry);

    let artifacts = Api::<KyvernoArtifact>::all(client.clone());
    let pods = Api::<Pod>::all(client.clone());

    tracing::info!(watcher_image = %config.watcher_image, "starting artifact controller");
    Controller::new(artifacts, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile,
            error_policy,
            Arc::new(Context {
                client,
                config,
                metrics,
            }),
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(name = %object.name, "reconciled"),
                Err(error) => tracing::warn!(%error, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(artifact: Arc<KyvernoArtifact>, error: &Error, _ctx: Arc<Context>) -> Action {
    tracing::warn!(artifact = %artifact.name_any(), %error, "requeueing after error");
    Action::requeue(REQUEUE_AFTER)
}

async fn reconcile(artifact: Arc<KyvernoArtifact>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = artifact.namespace().unwrap_or_default();
    let name = artifact.name_any();
    let artifacts: Api<KyvernoArtifact> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = match artifacts.get_opt(&name).await? {
        Some(artifact) => reconcile_worker(&artifact, &artifacts, &ctx).await,
        None => {
            // Worker pods carry an owner reference and are cascaded away by
            // the cluster; nothing to do here.
            tracing::info!(%name, %namespace, "artifact deleted, worker pod cleanup is cascaded");
            Ok(Action::await_change())
        }
    };

    update_metrics(&ctx).await;
    result
}

async fn reconcile_worker(
    artifact: &KyvernoArtifact,
    artifacts: &Api<KyvernoArtifact>,
    ctx: &Context,
) -> Result<Action, Error> {
    let namespace = artifact.namespace().unwrap_or_default();
    let Some(url) = artifact.url() else {
        record_conditions(
            artifacts,
            artifact,
            &[(
                "Degraded",
                "True",
                "MissingArtifactUrl",
                "spec.url is required but not set",
            )],
        )
        .await;
        return Err(Error::MissingArtifactUrl);
    };

    let pod_name = artifact.worker_pod_name();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let desired_env = projected_env(artifact, url, &ctx.config);

    match pods.get_opt(&pod_name).await? {
        None => {
            let pod = worker_pod(artifact, desired_env, &ctx.config);
            pods.create(&PostParams::default(), &pod).await?;
            tracing::info!(pod = %pod_name, %namespace, image = %ctx.config.watcher_image, "created worker pod");
            record_conditions(
                artifacts,
                artifact,
                &[
                    ("Progressing", "True", "CreatingWorker", "worker pod created"),
                    ("Degraded", "False", "WorkerProvisioned", ""),
                ],
            )
            .await;
        }
        Some(pod) => {
            let phase = pod_phase(&pod);
            if phase == "Failed" || phase == "Succeeded" {
                tracing::info!(pod = %pod_name, %phase, "worker pod in terminal phase, deleting for recreation");
                delete_pod(&pods, &pod_name).await?;
                record_conditions(
                    artifacts,
                    artifact,
                    &[("Progressing", "True", "RecreatingWorker", "worker pod was terminal")],
                )
                .await;
            } else if let Some(reason) = drift(&pod, &desired_env, &ctx.config.watcher_image) {
                tracing::info!(pod = %pod_name, %reason, "worker pod configuration drifted, deleting for recreation");
                delete_pod(&pods, &pod_name).await?;
                record_conditions(
                    artifacts,
                    artifact,
                    &[("Progressing", "True", "RecreatingWorker", &reason)],
                )
                .await;
            } else {
                tracing::debug!(pod = %pod_name, %phase, "worker pod up to date");
                record_conditions(
                    artifacts,
                    artifact,
                    &[
                        ("Available", "True", "WorkerRunning", ""),
                        ("Progressing", "False", "WorkerRunning", ""),
                        ("Degraded", "False", "WorkerRunning", ""),
                    ],
                )
                .await;
            }
        }
    }

    // Pod deletion events re-enter reconciliation through the ownership
    // watch, so there is no need for a timed requeue.
    Ok(Action::await_change())
}

async fn delete_pod(pods: &Api<Pod>, name: &str) -> Result<(), Error> {
    match pods.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// The environment the declaration projects into its worker pod. Optional
/// booleans are emitted only when the user set them; the worker applies its
/// own defaults otherwise.
fn projected_env(artifact: &KyvernoArtifact, url: &str, config: &ControllerConfig) -> Vec<EnvVar> {
    let mut env = vec![
        plain_env("IMAGE_BASE", url),
        plain_env("POLL_INTERVAL", &artifact.polling_interval().to_string()),
        plain_env("PROVIDER", artifact.provider_name()),
        plain_env("ARTIFACT_NAME", &artifact.name_any()),
    ];

    if let Some(value) = artifact.spec.delete_policies_on_termination {
        env.push(plain_env(
            "WATCHER_DELETE_POLICIES_ON_TERMINATION",
            &value.to_string(),
        ));
    }
    if let Some(value) = artifact.spec.reconcile_policies_from_checksum {
        env.push(plain_env(
            "WATCHER_CHECKSUM_RECONCILIATION_ENABLED",
            &value.to_string(),
        ));
    }
    if let Some(value) = artifact.spec.poll_for_tag_changes {
        env.push(plain_env(
            "WATCHER_POLL_FOR_TAG_CHANGES_ENABLED",
            &value.to_string(),
        ));
    }

    match artifact.provider_name() {
        "artifactory" => {
            env.push(secret_env(
                "ARTIFACTORY_USERNAME",
                &config.secret_name,
                &config.artifactory_username_key,
            ));
            env.push(secret_env(
                "ARTIFACTORY_PASSWORD",
                &config.secret_name,
                &config.artifactory_password_key,
            ));
        }
        _ => {
            env.push(secret_env(
                "GITHUB_TOKEN",
                &config.secret_name,
                &config.github_token_key,
            ));
        }
    }

    // Self-reconciliation inputs: the expected watcher image, and the pod's
    // own namespace via the downward API.
    env.push(plain_env("WATCHER_IMAGE", &config.watcher_image));
    env.push(EnvVar {
        name: "POD_NAMESPACE".into(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.namespace".into(),
                api_version: None,
            }),
            ..Default::default()
        }),
    });

    env
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                key: key.into(),
                name: secret.into(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn worker_pod(artifact: &KyvernoArtifact, env: Vec<EnvVar>, config: &ControllerConfig) -> Pod {
    let owner_references: Vec<_> = artifact.controller_owner_ref(&()).into_iter().collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(artifact.worker_pod_name()),
            namespace: artifact.namespace(),
            labels: Some(watcher_pod_labels(&artifact.name_any())),
            owner_references: Some(owner_references),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(config.service_account.clone()),
            restart_policy: Some("Always".into()),
            containers: vec![Container {
                name: "watcher".into(),
                image: Some(config.watcher_image.clone()),
                image_pull_policy: Some("Always".into()),
                args: Some(vec!["-watcher".into()]),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: "tmp".into(),
                    mount_path: "/tmp".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "tmp".into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Compares a live pod against the projection of the declaration. Any
/// divergence forces delete-and-recreate; pods are never patched in place.
fn drift(pod: &Pod, desired_env: &[EnvVar], watcher_image: &str) -> Option<String> {
    let container = pod.spec.as_ref()?.containers.first()?;

    let actual: BTreeMap<&str, &str> = container
        .env
        .iter()
        .flatten()
        .filter_map(|env| env.value.as_deref().map(|value| (env.name.as_str(), value)))
        .collect();
    let desired: BTreeMap<&str, &str> = desired_env
        .iter()
        .filter_map(|env| env.value.as_deref().map(|value| (env.name.as_str(), value)))
        .collect();

    for key in ["IMAGE_BASE", "POLL_INTERVAL", "PROVIDER"] {
        if actual.get(key) != desired.get(key) {
            return Some(format!("{key} changed"));
        }
    }

    // Absent means the worker default, which is enabled.
    let desired_polling = desired
        .get("WATCHER_POLL_FOR_TAG_CHANGES_ENABLED")
        .copied()
        .unwrap_or("true");
    let actual_polling = actual
        .get("WATCHER_POLL_FOR_TAG_CHANGES_ENABLED")
        .copied()
        .unwrap_or("true");
    if desired_polling != actual_polling {
        return Some("WATCHER_POLL_FOR_TAG_CHANGES_ENABLED changed".into());
    }

    if container.image.as_deref() != Some(watcher_image) {
        return Some("watcher image changed".into());
    }

    None
}

fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".into())
}

async fn record_conditions(
    api: &Api<KyvernoArtifact>,
    artifact: &KyvernoArtifact,
    updates: &[(&str, &str, &str, &str)],
) {
    let mut conditions = artifact
        .status
        .clone()
        .unwrap_or_default()
        .conditions;
    for (type_, status, reason, message) in updates.iter().copied() {
        set_condition(&mut conditions, type_, status, reason, message);
    }

    let patch = serde_json::json!({"status": {"conditions": conditions}});
    if let Err(error) = api
        .patch_status(
            &artifact.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        tracing::warn!(artifact = %artifact.name_any(), %error, "unable to update status conditions");
    }
}

/// Refreshes the two gauges: total declared artifacts, and artifacts bucketed
/// by their worker pod's phase (`Unknown` when the pod is missing). Metric
/// failures never fail reconciliation.
async fn update_metrics(ctx: &Context) {
    let artifacts: Api<KyvernoArtifact> = Api::all(ctx.client.clone());
    let list = match artifacts.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(error) => {
            tracing::warn!(%error, "unable to list artifacts for metrics");
            return;
        }
    };

    ctx.metrics.set_total(list.items.len() as i64);

    let mut by_phase: BTreeMap<String, i64> = BTreeMap::new();
    for artifact in &list.items {
        let namespace = artifact.namespace().unwrap_or_default();
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        let phase = match pods.get_opt(&artifact.worker_pod_name()).await {
            Ok(Some(pod)) => pod_phase(&pod),
            Ok(None) => "Unknown".to_string(),
            Err(error) => {
                tracing::warn!(%error, "unable to fetch worker pod for metrics");
                "Unknown".to_string()
            }
        };
        *by_phase.entry(phase).or_default() += 1;
    }

    ctx.metrics.reset_phases();
    for (phase, count) in by_phase {
        ctx.metrics.set_phase(&phase, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test::StaticEnv;
    use kyverno_artifact_operator_k8s_api::KyvernoArtifactSpec;

    fn spec() -> KyvernoArtifactSpec {
        KyvernoArtifactSpec {
            url: Some("ghcr.io/acme/pol".into()),
            artifact_type: None,
            provider: None,
            polling_interval: None,
            delete_policies_on_termination: None,
            reconcile_policies_from_checksum: None,
            poll_for_tag_changes: None,
        }
    }

    fn artifact(spec: KyvernoArtifactSpec) -> KyvernoArtifact {
        let mut artifact = KyvernoArtifact::new("alpha", spec);
        artifact.metadata.namespace = Some("policies".into());
        artifact.metadata.uid = Some("uid-1234".into());
        artifact
    }

    fn config() -> ControllerConfig {
        ControllerConfig::from_env(&StaticEnv::default())
    }

    fn env_value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
        env.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref())
    }

    #[test]
    fn config_defaults_match_the_documented_values() {
        let config = config();
        assert_eq!(
            config.watcher_image,
            "ghcr.io/octokode/kyverno-artifact-operator:latest"
        );
        assert_eq!(config.service_account, "kyverno-artifact-operator-watcher");
        assert_eq!(config.secret_name, "kyverno-watcher-secret");
        assert_eq!(config.github_token_key, "github-token");
        assert_eq!(config.artifactory_username_key, "artifactory-username");
        assert_eq!(config.artifactory_password_key, "artifactory-password");
    }

    #[test]
    fn projection_applies_interval_and_provider_defaults() {
        let artifact = artifact(spec());
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config());
        assert_eq!(env_value(&env, "IMAGE_BASE"), Some("ghcr.io/acme/pol"));
        assert_eq!(env_value(&env, "POLL_INTERVAL"), Some("60"));
        assert_eq!(env_value(&env, "PROVIDER"), Some("github"));
        assert_eq!(env_value(&env, "ARTIFACT_NAME"), Some("alpha"));
        // Unset booleans are not projected at all.
        assert!(!env.iter().any(|e| e.name == "WATCHER_POLL_FOR_TAG_CHANGES_ENABLED"));
        assert!(!env.iter().any(|e| e.name == "WATCHER_DELETE_POLICIES_ON_TERMINATION"));
    }

    #[test]
    fn explicit_booleans_are_projected_even_when_false() {
        let artifact = artifact(KyvernoArtifactSpec {
            poll_for_tag_changes: Some(false),
            reconcile_policies_from_checksum: Some(false),
            ..spec()
        });
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config());
        assert_eq!(
            env_value(&env, "WATCHER_POLL_FOR_TAG_CHANGES_ENABLED"),
            Some("false")
        );
        assert_eq!(
            env_value(&env, "WATCHER_CHECKSUM_RECONCILIATION_ENABLED"),
            Some("false")
        );
    }

    #[test]
    fn github_artifacts_get_a_token_secret_reference() {
        let artifact = artifact(spec());
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config());
        let token = env.iter().find(|e| e.name == "GITHUB_TOKEN").unwrap();
        let secret_ref = token
            .value_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(secret_ref.key, "github-token");
        assert_eq!(secret_ref.name.as_str(), "kyverno-watcher-secret");
        assert!(!env.iter().any(|e| e.name == "ARTIFACTORY_USERNAME"));
    }

    #[test]
    fn artifactory_artifacts_get_both_credential_references() {
        let artifact = artifact(KyvernoArtifactSpec {
            provider: Some("artifactory".into()),
            ..spec()
        });
        let env = projected_env(&artifact, "reg.example.com/repo/pol", &config());
        assert!(env.iter().any(|e| e.name == "ARTIFACTORY_USERNAME"));
        assert!(env.iter().any(|e| e.name == "ARTIFACTORY_PASSWORD"));
        assert!(!env.iter().any(|e| e.name == "GITHUB_TOKEN"));
    }

    #[test]
    fn pod_namespace_comes_from_the_downward_api() {
        let artifact = artifact(spec());
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config());
        let pod_namespace = env.iter().find(|e| e.name == "POD_NAMESPACE").unwrap();
        let field_path = pod_namespace
            .value_from
            .as_ref()
            .and_then(|s| s.field_ref.as_ref())
            .map(|f| f.field_path.as_str());
        assert_eq!(field_path, Some("metadata.namespace"));
    }

    #[test]
    fn worker_pod_projection_is_complete() {
        let artifact = artifact(spec());
        let config = config();
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config);
        let pod = worker_pod(&artifact, env, &config);

        assert_eq!(pod.metadata.name.as_deref(), Some("kyverno-artifact-manager-alpha"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("policies"));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app.kubernetes.io/instance"], "alpha");
        assert_eq!(labels["app.kubernetes.io/name"], "kyverno-artifact-watcher");

        let owners = pod.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "KyvernoArtifact");
        assert_eq!(owners[0].name, "alpha");
        assert_eq!(owners[0].uid, "uid-1234");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));

        let pod_spec = pod.spec.as_ref().unwrap();
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some("kyverno-artifact-operator-watcher")
        );
        let container = &pod_spec.containers[0];
        assert_eq!(container.args.as_ref().unwrap(), &vec!["-watcher".to_string()]);
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(container.image.as_deref(), Some(config.watcher_image.as_str()));
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].mount_path,
            "/tmp"
        );
        assert!(pod_spec.volumes.as_ref().unwrap()[0].empty_dir.is_some());
    }

    #[test]
    fn a_freshly_projected_pod_shows_no_drift() {
        let artifact = artifact(spec());
        let config = config();
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config);
        let pod = worker_pod(&artifact, env.clone(), &config);
        assert_eq!(drift(&pod, &env, &config.watcher_image), None);
    }

    #[test]
    fn poll_interval_drift_forces_recreation() {
        let artifact_before = artifact(spec());
        let config = config();
        let env_before = projected_env(&artifact_before, "ghcr.io/acme/pol", &config);
        let pod = worker_pod(&artifact_before, env_before, &config);

        let artifact_after = self::artifact(KyvernoArtifactSpec {
            polling_interval: Some(120),
            ..spec()
        });
        let env_after = projected_env(&artifact_after, "ghcr.io/acme/pol", &config);
        assert_eq!(
            drift(&pod, &env_after, &config.watcher_image).as_deref(),
            Some("POLL_INTERVAL changed")
        );
    }

    #[test]
    fn polling_flag_drift_treats_absent_as_enabled() {
        let config = config();
        let artifact_unset = artifact(spec());
        let env_unset = projected_env(&artifact_unset, "ghcr.io/acme/pol", &config);
        let pod = worker_pod(&artifact_unset, env_unset, &config);

        // Explicit true matches the absent default: no drift.
        let artifact_true = self::artifact(KyvernoArtifactSpec {
            poll_for_tag_changes: Some(true),
            ..spec()
        });
        let env_true = projected_env(&artifact_true, "ghcr.io/acme/pol", &config);
        assert_eq!(drift(&pod, &env_true, &config.watcher_image), None);

        // Explicit false diverges from it.
        let artifact_false = self::artifact(KyvernoArtifactSpec {
            poll_for_tag_changes: Some(false),
            ..spec()
        });
        let env_false = projected_env(&artifact_false, "ghcr.io/acme/pol", &config);
        assert!(drift(&pod, &env_false, &config.watcher_image).is_some());
    }

    #[test]
    fn image_drift_forces_recreation() {
        let artifact = artifact(spec());
        let config = config();
        let env = projected_env(&artifact, "ghcr.io/acme/pol", &config);
        let pod = worker_pod(&artifact, env.clone(), &config);
        assert_eq!(
            drift(&pod, &env, "ghcr.io/octokode/kyverno-artifact-operator:v2").as_deref(),
            Some("watcher image changed")
        );
    }
}
