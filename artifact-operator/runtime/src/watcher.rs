use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, ResourceExt};
use kyverno_artifact_operator_core::{labels, ImageBase, PolicyLabels, Provider};
use kyverno_artifact_operator_k8s_api::labels as pod_labels;
use kyverno_artifact_operator_k8s_api::{Pod, WORKER_POD_PREFIX};
use kyverno_artifact_operator_k8s_apply::{delete_policies_by_selector, ChecksumDiff};
use kyverno_artifact_operator_registry::{
    ArtifactoryClient, GhcrClient, OwnerType, RegistryClient, RegistryError,
};

use crate::env::{self, ConfigError, EnvLookup};
use crate::session::KubeSessionFactory;
use crate::state::TagStore;

/// Worker configuration, read once at startup from the environment the
/// controller projected into the pod.
#[derive(Debug)]
pub struct WatcherSettings {
    pub image_base: ImageBase,
    pub provider: Provider,
    pub github_token: Option<String>,
    pub artifactory_username: Option<String>,
    pub artifactory_password: Option<String>,
    pub owner_type: OwnerType,
    pub poll_interval: u64,
    pub poll_for_tag_changes: bool,
    pub delete_policies_on_termination: bool,
    pub reconcile_from_checksum: bool,
    pub artifact_name: Option<String>,
    pub watcher_image: Option<String>,
    pub pod_namespace: Option<String>,
}

impl WatcherSettings {
    pub fn from_env(env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        let image_base = ImageBase::new(
            env.get("IMAGE_BASE").ok_or(ConfigError::Missing("IMAGE_BASE"))?,
        );
        let provider: Provider = env::string_or(env, "PROVIDER", "github").parse()?;

        let mut github_token = None;
        let mut artifactory_username = None;
        let mut artifactory_password = None;
        match provider {
            Provider::Github => {
                let raw = env
                    .get("GITHUB_TOKEN")
                    .ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
                let token = sanitize_token(&raw)?;
                let prefix: String = token.chars().take(10).collect();
                tracing::info!(token_prefix = %prefix, length = token.len(), "using GitHub token");
                // Reject a malformed reference now rather than on every poll.
                image_base.ghcr_owner_and_package()?;
                github_token = Some(token);
            }
            Provider::Artifactory => {
                let username = env
                    .get("ARTIFACTORY_USERNAME")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::Missing("ARTIFACTORY_USERNAME"))?;
                let password = env
                    .get("ARTIFACTORY_PASSWORD")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::Missing("ARTIFACTORY_PASSWORD"))?;
                tracing::info!(%username, "using Artifactory credentials");
                artifactory_username = Some(username);
                artifactory_password = Some(password);
            }
        }

        // The artifact name links applied policies back to their declaration.
        // Fall back to the pod name, which the controller derives from it.
        let artifact_name = env.get("ARTIFACT_NAME").or_else(|| {
            env.get("HOSTNAME")
                .and_then(|hostname| hostname.strip_prefix(WORKER_POD_PREFIX).map(str::to_string))
        });

        Ok(Self {
            image_base,
            provider,
            github_token,
            artifactory_username,
            artifactory_password,
            owner_type: OwnerType::parse(&env::string_or(env, "GITHUB_API_OWNER_TYPE", "users")),
            poll_interval: env::int_or(env, "POLL_INTERVAL", 30),
            poll_for_tag_changes: env::bool_or(env, "WATCHER_POLL_FOR_TAG_CHANGES_ENABLED", true),
            delete_policies_on_termination: env::bool_or(
                env,
                "WATCHER_DELETE_POLICIES_ON_TERMINATION",
                false,
            ),
            reconcile_from_checksum: env::bool_or(
                env,
                "WATCHER_CHECKSUM_RECONCILIATION_ENABLED",
                false,
            ),
            artifact_name,
            watcher_image: env.get("WATCHER_IMAGE"),
            pod_namespace: env.get("POD_NAMESPACE"),
        })
    }

    pub fn registry_client(&self) -> Result<Box<dyn RegistryClient>, RegistryError> {
        match self.provider {
            Provider::Github => Ok(Box::new(GhcrClient::new(
                self.image_base.clone(),
                self.github_token.clone().unwrap_or_default(),
                self.owner_type,
            )?)),
            Provider::Artifactory => Ok(Box::new(ArtifactoryClient::new(
                self.image_base.clone(),
                self.artifactory_username.clone().unwrap_or_default(),
                self.artifactory_password.clone().unwrap_or_default(),
            )?)),
        }
    }
}

/// GitHub tokens occasionally pick up stray control characters from secret
/// tooling; strip everything outside printable ASCII and require a non-empty
/// remainder.
fn sanitize_token(raw: &str) -> Result<String, ConfigError> {
    let token: String = raw
        .trim()
        .chars()
        .filter(|c| (32..=126).contains(&(*c as u32)))
        .collect();
    if token.is_empty() {
        Err(ConfigError::EmptyToken)
    } else {
        Ok(token)
    }
}

/// One cycle's view of the cluster: the applier plus the checksum
/// reconciler, built from a fresh discovery run.
#[async_trait]
pub trait ClusterSession: Send + Sync {
    async fn apply_file(&self, file: &Path) -> anyhow::Result<()>;
    async fn changed_files(
        &self,
        fingerprints: &BTreeMap<PathBuf, String>,
    ) -> anyhow::Result<ChecksumDiff>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> anyhow::Result<Box<dyn ClusterSession>>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The registry reports no versions, or pinned mode found no tag.
    NoVersions,
    /// Nothing changed and checksum reconciliation is disabled.
    UpToDate,
    /// Checksum reconciliation found the cluster already in sync.
    InSync,
    /// Files were applied (or attempted); the bookmark was advanced.
    Applied { tag: String, files: usize },
}

struct TagCheck {
    latest: String,
    previous: Option<String>,
    changed: bool,
}

/// The steady-state worker loop.
pub struct Watcher {
    settings: WatcherSettings,
    registry: Box<dyn RegistryClient>,
    sessions: Box<dyn SessionFactory>,
    store: TagStore,
}

impl Watcher {
    pub fn new(
        settings: WatcherSettings,
        registry: Box<dyn RegistryClient>,
        sessions: Box<dyn SessionFactory>,
        store: TagStore,
    ) -> Self {
        Self {
            settings,
            registry,
            sessions,
            store,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            if let Err(error) = self.cycle().await {
                tracing::error!(%error, "error in watch loop");
            }
            tokio::time::sleep(Duration::from_secs(self.settings.poll_interval)).await;
        }
    }

    /// One reconciliation cycle: determine the tag, short-circuit when
    /// nothing changed, otherwise pull and apply.
    pub async fn cycle(&self) -> anyhow::Result<CycleOutcome> {
        let Some(check) = self.check_tag().await? else {
            return Ok(CycleOutcome::NoVersions);
        };

        if !check.changed && !self.settings.reconcile_from_checksum {
            tracing::info!(latest = %check.latest, "no change");
            return Ok(CycleOutcome::UpToDate);
        }
        if check.changed {
            tracing::info!(
                previous = %check.previous.as_deref().unwrap_or_default(),
                new = %check.latest,
                "detected change"
            );
        }

        let session = self.sessions.open().await?;

        let scratch = self.store.scratch_dir(&check.latest);
        let stamp = PolicyLabels {
            tag: check.latest.clone(),
            artifact_name: self.settings.artifact_name.clone(),
        };
        let fingerprints = kyverno_artifact_operator_registry::pull(
            self.registry.as_ref(),
            &check.latest,
            &scratch,
            &stamp,
        )
        .await?;

        let to_apply: Vec<PathBuf> = if check.changed {
            fingerprints.keys().cloned().collect()
        } else {
            let diff = session.changed_files(&fingerprints).await?;
            if !diff.changed {
                tracing::info!(tag = %check.latest, "cluster is in sync with pulled checksums");
                return Ok(CycleOutcome::InSync);
            }
            diff.files
        };

        let mut applied = 0usize;
        for file in &to_apply {
            match session.apply_file(file).await {
                Ok(()) => {
                    tracing::info!(file = %file.display(), "applied");
                    applied += 1;
                }
                Err(error) => {
                    tracing::warn!(file = %file.display(), %error, "failed to apply, continuing");
                }
            }
        }

        if !to_apply.is_empty() {
            self.store.record(&check.latest)?;
        }
        Ok(CycleOutcome::Applied {
            tag: check.latest,
            files: applied,
        })
    }

    async fn check_tag(&self) -> anyhow::Result<Option<TagCheck>> {
        if self.settings.poll_for_tag_changes {
            let Some(latest) = self.registry.latest_tag().await? else {
                tracing::info!("no versions found for package");
                return Ok(None);
            };
            let previous = self.store.last_applied();
            let changed = previous.as_deref() != Some(latest.as_str());
            return Ok(Some(TagCheck {
                latest,
                previous,
                changed,
            }));
        }

        // Pinned mode: the tag comes from the reference itself. A cold start
        // (no bookmark) is not a change, so checksum reconciliation decides
        // what to apply.
        let Some(tag) = self.settings.image_base.pinned_tag() else {
            tracing::info!("no tag pinned in IMAGE_BASE and polling is disabled, nothing to do");
            return Ok(None);
        };
        let previous = self.store.last_applied();
        let changed = matches!(&previous, Some(previous) if previous != tag);
        Ok(Some(TagCheck {
            latest: tag.to_string(),
            previous,
            changed,
        }))
    }
}

/// Startup sweep: delete sibling watcher pods running a stale image. The
/// controller recreates them at the configured image. Best effort only.
pub async fn reconcile_siblings(client: &Client, namespace: &str, expected_image: &str) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = match pods
        .list(&ListParams::default().labels(&pod_labels::watcher_selector()))
        .await
    {
        Ok(list) => list,
        Err(error) => {
            tracing::warn!(%error, "unable to list watcher pods for self-reconciliation");
            return;
        }
    };

    for pod in list {
        let name = pod.name_any();
        let image = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .and_then(|container| container.image.as_deref());
        let Some(image) = image else { continue };
        if image == expected_image {
            continue;
        }
        tracing::info!(pod = %name, %image, %expected_image, "deleting watcher pod with outdated image");
        if let Err(error) = pods.delete(&name, &DeleteParams::default()).await {
            tracing::warn!(pod = %name, %error, "unable to delete outdated watcher pod");
        }
    }
}

/// Installs the termination handler that sweeps this artifact's policies out
/// of the cluster before exiting.
fn spawn_cleanup_handler(client: Client, artifact_name: Option<String>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let signals = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
        );
        let (Ok(mut term), Ok(mut int), Ok(mut quit)) = signals else {
            tracing::warn!("unable to install termination signal handlers");
            return;
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
            _ = quit.recv() => {}
        }

        tracing::info!("received termination signal, cleaning up policies");
        let selector = labels::artifact_selector(artifact_name.as_deref().unwrap_or_default());
        delete_policies_by_selector(&client, &selector).await;
        tracing::info!("policy cleanup complete");
        std::process::exit(0);
    });
}

/// Watcher-mode entry point.
pub async fn run(env: &dyn EnvLookup) -> anyhow::Result<()> {
    let settings = WatcherSettings::from_env(env)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = %settings.provider,
        reference = %settings.image_base,
        "starting artifact watcher"
    );

    let client = Client::try_default().await?;

    if let (Some(namespace), Some(image)) =
        (settings.pod_namespace.clone(), settings.watcher_image.clone())
    {
        reconcile_siblings(&client, &namespace, &image).await;
    }

    if settings.delete_policies_on_termination {
        spawn_cleanup_handler(client.clone(), settings.artifact_name.clone());
    }

    let registry = settings.registry_client()?;
    let store = TagStore::open_default()?;
    let sessions = Box::new(KubeSessionFactory::new(client));
    Watcher::new(settings, registry, sessions, store).run().await
}
