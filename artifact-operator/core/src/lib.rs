//! Core domain types for the artifact operator: image references, policy
//! manifests, and the content fingerprint shared by the pull pipeline and the
//! in-cluster reconcilers.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod fingerprint;
pub mod manifest;
pub mod provider;
pub mod reference;

pub use self::fingerprint::{fingerprint_bytes, spec_fingerprint, FINGERPRINT_LEN};
pub use self::manifest::{labels, Manifest, ManifestError, PolicyLabels};
pub use self::provider::Provider;
pub use self::reference::{sanitize_tag, ImageBase, ReferenceError};
