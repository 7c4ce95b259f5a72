use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams};
use kube::{Api, Client, ResourceExt};
use kyverno_artifact_operator_core::labels;
use kyverno_artifact_operator_k8s_api::{worker_pod_name, KyvernoArtifact, Pod, WORKER_POD_PREFIX};
use kyverno_artifact_operator_k8s_apply::{cluster_policy_resource, policy_resource};

#[derive(Debug, Parser)]
#[command(name = "gc", about = "Garbage-collects orphaned managed policies")]
pub struct GcArgs {
    /// Seconds between garbage collection cycles.
    #[arg(long = "poll-interval", env = "GC_POLL_INTERVAL", default_value_t = 60)]
    pub poll_interval: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Policy,
    ClusterPolicy,
}

impl PolicyKind {
    fn resource(&self) -> ApiResource {
        match self {
            Self::Policy => policy_resource(),
            Self::ClusterPolicy => cluster_policy_resource(),
        }
    }
}

/// One managed policy object as the collector sees it.
#[derive(Clone, Debug)]
pub struct PolicyRecord {
    pub kind: PolicyKind,
    pub namespace: Option<String>,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl PolicyRecord {
    /// Grace-map key: `kind/namespace/name`, or `kind/name` for
    /// cluster-scoped objects.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{:?}/{namespace}/{}", self.kind, self.name),
            None => format!("{:?}/{}", self.kind, self.name),
        }
    }
}

/// The collector's window onto the cluster, injectable for tests.
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn managed_policies(&self) -> anyhow::Result<Vec<PolicyRecord>>;
    async fn artifact_exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn any_artifacts(&self) -> anyhow::Result<bool>;
    async fn worker_alive(&self, artifact_name: &str) -> anyhow::Result<bool>;
    async fn any_worker_alive(&self) -> anyhow::Result<bool>;
    async fn delete_policy(&self, policy: &PolicyRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub deleted: usize,
    pub pending: usize,
}

/// Two-phase garbage collector: an orphan is only deleted after it has been
/// observed orphaned in two consecutive cycles. The grace map is in-memory
/// and does not survive restarts.
pub struct GarbageCollector<V> {
    view: V,
    pending: HashMap<String, Instant>,
}

impl<V: ClusterView> GarbageCollector<V> {
    pub fn new(view: V) -> Self {
        Self {
            view,
            pending: HashMap::new(),
        }
    }

    pub async fn run(mut self, interval: Duration) -> anyhow::Result<()> {
        loop {
            match self.collect().await {
                Ok(summary) => tracing::info!(
                    deleted = summary.deleted,
                    pending = summary.pending,
                    "garbage collection cycle complete"
                ),
                Err(error) => tracing::warn!(%error, "garbage collection cycle failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn collect(&mut self) -> anyhow::Result<GcSummary> {
        let policies = self.view.managed_policies().await?;
        tracing::info!(count = policies.len(), "checking managed policies");

        let mut summary = GcSummary::default();
        for policy in &policies {
            let key = policy.key();

            if !self.is_orphaned(policy).await {
                if self.pending.remove(&key).is_some() {
                    tracing::info!(policy = %key, "no longer orphaned, clearing pending state");
                }
                continue;
            }

            let first_seen = match self.pending.get(&key).copied() {
                Some(first_seen) => first_seen,
                None => {
                    self.pending.insert(key.clone(), Instant::now());
                    tracing::info!(policy = %key, "orphaned policy found, waiting one cycle before deletion");
                    summary.pending += 1;
                    continue;
                }
            };
            tracing::info!(
                policy = %key,
                orphaned_for_secs = first_seen.elapsed().as_secs(),
                "re-checking orphaned policy before deletion"
            );

            // The world may have moved between the listing and now.
            if !self.is_orphaned(policy).await {
                tracing::info!(policy = %key, "no longer orphaned, clearing pending state");
                self.pending.remove(&key);
                continue;
            }

            match self.view.delete_policy(policy).await {
                Ok(()) => {
                    tracing::info!(policy = %key, "deleted orphaned policy");
                    self.pending.remove(&key);
                    summary.deleted += 1;
                }
                Err(error) => {
                    tracing::warn!(policy = %key, %error, "failed to delete orphaned policy");
                }
            }
        }
        Ok(summary)
    }

    /// The orphan predicate. Probe failures count as "not orphaned" so a
    /// flaky API server never triggers deletions.
    async fn is_orphaned(&self, policy: &PolicyRecord) -> bool {
        if !policy.labels.contains_key(labels::POLICY_VERSION) {
            tracing::debug!(policy = %policy.name, "no policy-version label, skipping");
            return false;
        }

        let Some(artifact) = policy.labels.get(labels::ARTIFACT_NAME) else {
            return self.is_orphaned_legacy(policy).await;
        };

        match self.view.artifact_exists(artifact).await {
            Ok(false) => {
                tracing::info!(policy = %policy.name, %artifact, "declared artifact is gone");
                return true;
            }
            Ok(true) => {}
            Err(error) => {
                tracing::warn!(%artifact, %error, "unable to check for declared artifact");
                return false;
            }
        }

        match self.view.worker_alive(artifact).await {
            Ok(false) => {
                tracing::info!(policy = %policy.name, %artifact, "no live worker pod for artifact");
                true
            }
            Ok(true) => false,
            Err(error) => {
                tracing::warn!(%artifact, %error, "unable to check for worker pod");
                false
            }
        }
    }

    /// Policies applied before artifact-name stamping existed can only be
    /// checked cluster-wide.
    async fn is_orphaned_legacy(&self, policy: &PolicyRecord) -> bool {
        tracing::debug!(policy = %policy.name, "no artifact-name label, using legacy orphan check");

        match self.view.any_worker_alive().await {
            Ok(false) => {
                tracing::info!(policy = %policy.name, "no live watcher pods in the cluster");
                return true;
            }
            Ok(true) => {}
            Err(error) => {
                tracing::warn!(%error, "unable to check for watcher pods");
                return false;
            }
        }

        match self.view.any_artifacts().await {
            Ok(false) => {
                tracing::info!(policy = %policy.name, "no declared artifacts in the cluster");
                true
            }
            Ok(true) => false,
            Err(error) => {
                tracing::warn!(%error, "unable to check for declared artifacts");
                false
            }
        }
    }
}

/// Live view over the dynamic and typed clients.
pub struct KubeClusterView {
    client: Client,
}

impl KubeClusterView {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn managed_policies(&self) -> anyhow::Result<Vec<PolicyRecord>> {
        let mut policies = Vec::new();
        for kind in [PolicyKind::Policy, PolicyKind::ClusterPolicy] {
            let resource = kind.resource();
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
            let list = api
                .list(&ListParams::default().labels(&labels::managed_selector()))
                .await?;
            policies.extend(list.items.into_iter().map(|item| PolicyRecord {
                kind,
                namespace: item.namespace(),
                name: item.name_any(),
                labels: item.labels().clone(),
            }));
        }
        Ok(policies)
    }

    async fn artifact_exists(&self, name: &str) -> anyhow::Result<bool> {
        let api = Api::<KyvernoArtifact>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().any(|artifact| artifact.name_any() == name))
    }

    async fn any_artifacts(&self) -> anyhow::Result<bool> {
        let api = Api::<KyvernoArtifact>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(!list.items.is_empty())
    }

    async fn worker_alive(&self, artifact_name: &str) -> anyhow::Result<bool> {
        let expected_prefix = worker_pod_name(artifact_name);
        self.live_worker_with_prefix(&expected_prefix).await
    }

    async fn any_worker_alive(&self) -> anyhow::Result<bool> {
        self.live_worker_with_prefix(WORKER_POD_PREFIX).await
    }

    async fn delete_policy(&self, policy: &PolicyRecord) -> anyhow::Result<()> {
        let resource = policy.kind.resource();
        let api: Api<DynamicObject> = match &policy.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        api.delete(&policy.name, &DeleteParams::default()).await?;
        Ok(())
    }
}

impl KubeClusterView {
    /// A worker counts as live while its pod phase is Running or Pending.
    async fn live_worker_with_prefix(&self, prefix: &str) -> anyhow::Result<bool> {
        let pods = Api::<Pod>::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.iter().any(|pod| {
            let phase = pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .unwrap_or_default();
            pod.name_any().starts_with(prefix) && matches!(phase, "Running" | "Pending")
        }))
    }
}

/// GC-mode entry point.
pub async fn run(args: GcArgs) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        poll_interval_secs = args.poll_interval,
        "starting policy garbage collector"
    );
    let client = Client::try_default().await?;
    GarbageCollector::new(KubeClusterView::new(client))
        .run(Duration::from_secs(args.poll_interval))
        .await
}
