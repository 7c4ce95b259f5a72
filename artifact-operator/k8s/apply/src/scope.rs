use kube::api::{ApiResource, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;

/// Resolves a manifest's group/version/kind to its server-side resource and
/// scope. A fresh mapper is built per reconciliation cycle so that custom
/// resource definitions installed after startup are picked up.
pub trait ScopeLookup: Send + Sync {
    fn resolve(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, Scope)>;
}

pub struct ScopeMapper {
    discovery: Discovery,
}

impl ScopeMapper {
    /// Runs API discovery against the cluster.
    pub async fn discover(client: Client) -> kube::Result<Self> {
        let discovery = Discovery::new(client).run().await?;
        Ok(Self { discovery })
    }
}

impl ScopeLookup for ScopeMapper {
    fn resolve(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, Scope)> {
        self.discovery
            .resolve_gvk(gvk)
            .map(|(resource, capabilities)| (resource, capabilities.scope))
    }
}
