use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams};
use kube::{Api, Client, ResourceExt};

use crate::{cluster_policy_resource, policy_resource};

/// Deletes every `Policy` and `ClusterPolicy` matching the label selector,
/// across all namespaces. Individual failures are logged and skipped so a
/// terminating worker can always finish its sweep.
pub async fn delete_policies_by_selector(client: &Client, selector: &str) {
    for resource in [policy_resource(), cluster_policy_resource()] {
        if let Err(error) = delete_matching(client, &resource, selector).await {
            tracing::warn!(
                kind = %resource.kind,
                %selector,
                %error,
                "failed to delete policy resources"
            );
        }
    }
}

async fn delete_matching(
    client: &Client,
    resource: &ApiResource,
    selector: &str,
) -> kube::Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), resource);
    let list = api.list(&ListParams::default().labels(selector)).await?;

    for item in list.items {
        let name = item.name_any();
        tracing::info!(kind = %resource.kind, %name, "deleting");

        let scoped: Api<DynamicObject> = match item.namespace() {
            Some(namespace) => Api::namespaced_with(client.clone(), &namespace, resource),
            None => Api::all_with(client.clone(), resource),
        };
        if let Err(error) = scoped.delete(&name, &DeleteParams::default()).await {
            tracing::warn!(kind = %resource.kind, %name, %error, "failed to delete");
        }
    }

    Ok(())
}
