#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod artifact;
pub mod condition;
pub mod labels;

pub use self::artifact::{
    worker_pod_name, KyvernoArtifact, KyvernoArtifactSpec, KyvernoArtifactStatus,
    WORKER_POD_PREFIX,
};
pub use self::condition::set_condition;
pub use k8s_openapi::{
    api::core::v1::{
        Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, PodSpec,
        SecretKeySelector, Volume, VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time},
};
pub use kube::{
    api::{Api, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, CustomResourceExt, Error, Resource, ResourceExt,
};
