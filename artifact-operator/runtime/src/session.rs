use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::Client;
use kyverno_artifact_operator_k8s_apply::{Applier, ChecksumDiff, ScopeMapper};

use crate::watcher::{ClusterSession, SessionFactory};

/// Builds a live cluster session per cycle. Discovery runs fresh each time so
/// custom resource definitions installed after worker startup are honored.
pub struct KubeSessionFactory {
    client: Client,
}

impl KubeSessionFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionFactory for KubeSessionFactory {
    async fn open(&self) -> anyhow::Result<Box<dyn ClusterSession>> {
        let scopes = ScopeMapper::discover(self.client.clone()).await?;
        Ok(Box::new(KubeSession {
            applier: Applier::new(self.client.clone(), scopes),
        }))
    }
}

struct KubeSession {
    applier: Applier<ScopeMapper>,
}

#[async_trait]
impl ClusterSession for KubeSession {
    async fn apply_file(&self, file: &Path) -> anyhow::Result<()> {
        self.applier.apply_file(file).await
    }

    async fn changed_files(
        &self,
        fingerprints: &BTreeMap<PathBuf, String>,
    ) -> anyhow::Result<ChecksumDiff> {
        self.applier.changed_files(fingerprints).await
    }
}
