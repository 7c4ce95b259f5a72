//! Dynamic-client plumbing shared by the worker, the termination cleanup, and
//! the garbage collector: a discovery-backed scope mapper and a
//! create-or-update applier for arbitrary manifests.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod apply;
pub mod cleanup;
pub mod reconcile;
pub mod scope;

pub use self::apply::{parse_documents, Applier};
pub use self::cleanup::delete_policies_by_selector;
pub use self::reconcile::ChecksumDiff;
pub use self::scope::{ScopeLookup, ScopeMapper};

use kube::api::{ApiResource, GroupVersionKind};

/// `kyverno.io/v1 Policy` (namespaced).
pub fn policy_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kyverno.io", "v1", "Policy"),
        "policies",
    )
}

/// `kyverno.io/v1 ClusterPolicy` (cluster-scoped).
pub fn cluster_policy_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kyverno.io", "v1", "ClusterPolicy"),
        "clusterpolicies",
    )
}

/// The declared-artifact resource itself, for cross-namespace existence
/// probes that do not go through the typed client.
pub fn artifact_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kyverno.octokode.io", "v1alpha1", "KyvernoArtifact"),
        "kyvernoartifacts",
    )
}
