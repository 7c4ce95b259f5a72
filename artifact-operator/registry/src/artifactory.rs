use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use kyverno_artifact_operator_core::ImageBase;
use oci_distribution::client::{Client as OciClient, ClientConfig};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;

use crate::{RegistryClient, RegistryError, POLICY_LAYER_MEDIA_TYPE};

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// ORAS convention: layers of a file-based artifact carry their original file
/// name in this annotation.
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

#[derive(Debug, Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// The registry returns tags in its own order; the last entry is trusted to
/// be the most recent. This is an ordering assumption inherited for
/// compatibility, not a registry guarantee.
fn select_latest(tags: &[String]) -> Option<String> {
    tags.last().cloned()
}

/// Artifactory Docker-registry-v2 client with basic-auth credentials.
pub struct ArtifactoryClient {
    http: reqwest::Client,
    base: ImageBase,
    username: String,
    password: String,
}

impl ArtifactoryClient {
    pub fn new(
        base: ImageBase,
        username: String,
        password: String,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            username,
            password,
        })
    }
}

#[async_trait]
impl RegistryClient for ArtifactoryClient {
    async fn latest_tag(&self) -> Result<Option<String>, RegistryError> {
        // A concrete tag embedded in the reference short-circuits the listing,
        // even while polling. `latest` is the one tag that does not pin.
        if let Some(tag) = self.base.pinned_tag() {
            if tag != "latest" {
                return Ok(Some(tag.to_string()));
            }
        }

        let (registry, repository) = self
            .base
            .registry_and_repository()
            .map_err(|e| RegistryError::Reference(e.to_string()))?;
        let url = format!("https://{registry}/v2/{repository}/tags/list");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RegistryError::from_status(
                status.as_u16(),
                &body,
                &format!("repository {repository} not found on {registry}"),
            ));
        }

        let listing: TagList =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        let latest = select_latest(&listing.tags);
        if let Some(tag) = &latest {
            tracing::info!(%tag, available = listing.tags.len(), "found latest Artifactory tag");
        }
        Ok(latest)
    }

    async fn fetch(&self, tag: &str, dest: &Path) -> Result<(), RegistryError> {
        let reference = Reference::try_from(self.base.with_tag(tag).as_str())
            .map_err(|e| RegistryError::Reference(e.to_string()))?;
        tracing::info!(%reference, "pulling OCI artifact");

        let client = OciClient::new(ClientConfig::default());
        let auth = RegistryAuth::Basic(self.username.clone(), self.password.clone());
        let image = client
            .pull(
                &reference,
                &auth,
                vec![
                    POLICY_LAYER_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                    "application/yaml",
                    "text/yaml",
                ],
            )
            .await?;

        // Restore each layer under the file name it was pushed with, falling
        // back to an index-based name. Directory components in the annotation
        // are discarded so a layer cannot escape the scratch directory.
        for (index, layer) in image.layers.iter().enumerate() {
            if layer.data.is_empty() {
                tracing::debug!(index, "layer is empty, skipping");
                continue;
            }
            let title = layer
                .annotations
                .as_ref()
                .and_then(|a| a.get(TITLE_ANNOTATION))
                .and_then(|t| Path::new(t).file_name())
                .map(|n| n.to_string_lossy().into_owned());
            let file = dest.join(title.unwrap_or_else(|| format!("layer-{index}.yaml")));
            std::fs::write(&file, &layer.data)?;
            tracing::debug!(file = %file.display(), bytes = layer.data.len(), "saved layer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(reference: &str) -> ArtifactoryClient {
        ArtifactoryClient::new(ImageBase::new(reference), "user".into(), "pass".into()).unwrap()
    }

    #[tokio::test]
    async fn embedded_tag_short_circuits_the_listing() {
        let client = client("artifactory.example.com/docker/policies:3.1.4");
        assert_eq!(client.latest_tag().await.unwrap().as_deref(), Some("3.1.4"));
    }

    #[test]
    fn latest_tag_is_the_last_listed() {
        let tags: Vec<String> = ["1.0", "1.1", "2.0"].iter().map(|s| s.to_string()).collect();
        assert_eq!(select_latest(&tags).as_deref(), Some("2.0"));
        assert_eq!(select_latest(&[]), None);
    }

    #[test]
    fn tag_listing_tolerates_a_missing_tags_field() {
        let listing: TagList = serde_json::from_str(r#"{"name": "docker/policies"}"#).unwrap();
        assert!(listing.tags.is_empty());
    }
}
