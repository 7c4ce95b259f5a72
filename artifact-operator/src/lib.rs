#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kyverno_artifact_operator_core::{
    fingerprint_bytes, labels, sanitize_tag, spec_fingerprint, ImageBase, Manifest, PolicyLabels,
    Provider,
};
pub use kyverno_artifact_operator_k8s_api as k8s;
pub use kyverno_artifact_operator_k8s_apply as apply;
pub use kyverno_artifact_operator_registry as registry;
pub use kyverno_artifact_operator_runtime as runtime;
