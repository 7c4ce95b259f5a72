#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("image reference {reference:?} must be in the form <registry>/<repository>")]
    MissingRepository { reference: String },
    #[error("image reference {reference:?} must be in the form ghcr.io/<owner>/<package>")]
    MissingOwner { reference: String },
}

/// An OCI reference as declared in a `KyvernoArtifact`, e.g.
/// `ghcr.io/acme/policies` or `registry.example.com/repo/path:v3`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBase {
    raw: String,
}

impl ImageBase {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            raw: reference.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The reference without any trailing tag.
    pub fn repository(&self) -> &str {
        match self.pinned_tag() {
            Some(tag) => &self.raw[..self.raw.len() - tag.len() - 1],
            None => &self.raw,
        }
    }

    /// The tag embedded in the reference: everything after the last `:`, if
    /// and only if that suffix contains no `/`. A registry port
    /// (`registry:5000/repo`) therefore never reads as a tag.
    pub fn pinned_tag(&self) -> Option<&str> {
        let (_, suffix) = self.raw.rsplit_once(':')?;
        if suffix.is_empty() || suffix.contains('/') {
            return None;
        }
        Some(suffix)
    }

    /// The full reference for a concrete tag.
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{tag}", self.repository())
    }

    /// Splits the reference into registry host and repository path, for the
    /// Docker Registry v2 tag listing endpoint.
    pub fn registry_and_repository(&self) -> Result<(&str, &str), ReferenceError> {
        self.repository()
            .split_once('/')
            .filter(|(registry, repo)| !registry.is_empty() && !repo.is_empty())
            .ok_or_else(|| ReferenceError::MissingRepository {
                reference: self.raw.clone(),
            })
    }

    /// Extracts the GHCR owner and package name. The package may itself
    /// contain `/` separators.
    pub fn ghcr_owner_and_package(&self) -> Result<(&str, &str), ReferenceError> {
        let mut parts = self.repository().splitn(3, '/');
        let _registry = parts.next();
        let owner = parts.next().unwrap_or_default();
        let package = parts.next().unwrap_or_default();
        if owner.is_empty() || package.is_empty() {
            return Err(ReferenceError::MissingOwner {
                reference: self.raw.clone(),
            });
        }
        Ok((owner, package))
    }

    /// The package name escaped for use as a single GitHub API path segment.
    pub fn ghcr_escaped_package(&self) -> Result<String, ReferenceError> {
        let (_, package) = self.ghcr_owner_and_package()?;
        Ok(package.replace('/', "%2F"))
    }
}

impl std::fmt::Display for ImageBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Rewrites a tag so it is safe to use as a directory name.
pub fn sanitize_tag(tag: &str) -> String {
    tag.replace([':', '/'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_tag_requires_slash_free_suffix() {
        assert_eq!(ImageBase::new("ghcr.io/acme/pol:v1").pinned_tag(), Some("v1"));
        assert_eq!(ImageBase::new("ghcr.io/acme/pol").pinned_tag(), None);
        // A port is not a tag.
        assert_eq!(ImageBase::new("registry:5000/repo").pinned_tag(), None);
        assert_eq!(
            ImageBase::new("registry:5000/repo:v2").pinned_tag(),
            Some("v2")
        );
    }

    #[test]
    fn repository_strips_the_tag_only() {
        assert_eq!(ImageBase::new("ghcr.io/acme/pol:v1").repository(), "ghcr.io/acme/pol");
        assert_eq!(
            ImageBase::new("registry:5000/repo").repository(),
            "registry:5000/repo"
        );
    }

    #[test]
    fn with_tag_replaces_an_embedded_tag() {
        assert_eq!(
            ImageBase::new("ghcr.io/acme/pol:v1").with_tag("v2"),
            "ghcr.io/acme/pol:v2"
        );
    }

    #[test]
    fn registry_split_for_tag_listing() {
        let base = ImageBase::new("artifactory.example.com/docker/policies:3.0");
        assert_eq!(
            base.registry_and_repository().unwrap(),
            ("artifactory.example.com", "docker/policies")
        );
        assert!(ImageBase::new("no-slashes").registry_and_repository().is_err());
    }

    #[test]
    fn ghcr_owner_and_nested_package() {
        let base = ImageBase::new("ghcr.io/acme/policies/prod:v1");
        assert_eq!(base.ghcr_owner_and_package().unwrap(), ("acme", "policies/prod"));
        assert_eq!(base.ghcr_escaped_package().unwrap(), "policies%2Fprod");
        assert!(ImageBase::new("ghcr.io/acme").ghcr_owner_and_package().is_err());
    }

    #[test]
    fn sanitized_tags_are_path_safe() {
        assert_eq!(sanitize_tag("v1.2.3"), "v1.2.3");
        assert_eq!(sanitize_tag("feature/x:latest"), "feature_x_latest");
    }
}
