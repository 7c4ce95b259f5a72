use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kyverno_artifact_operator_core::ImageBase;
use oci_distribution::client::{Client as OciClient, ClientConfig};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;

use crate::{RegistryClient, RegistryError, POLICY_LAYER_MEDIA_TYPE};

const API_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "kyverno-artifact-operator";

/// Whether the GHCR package lives under a user or an organization account.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OwnerType {
    #[default]
    Users,
    Orgs,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Orgs => "orgs",
        }
    }

    /// Parses the `GITHUB_API_OWNER_TYPE` value; anything but `orgs` means
    /// `users`.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("orgs") {
            Self::Orgs
        } else {
            Self::Users
        }
    }
}

/// One entry of the GHCR package versions listing.
#[derive(Clone, Debug, Deserialize)]
pub struct PackageVersion {
    pub id: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: VersionMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub container: ContainerMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The most recently updated version wins. Tag names are preferred; untagged
/// versions fall back to the pseudo-tag `version-id-<id>`.
fn select_latest(versions: &[PackageVersion]) -> Option<String> {
    let latest = versions.iter().max_by_key(|v| v.updated_at)?;
    Some(
        latest
            .metadata
            .container
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| format!("version-id-{}", latest.id)),
    )
}

/// GitHub Container Registry client: tag discovery through the Packages API,
/// pulls through the OCI distribution protocol.
pub struct GhcrClient {
    http: reqwest::Client,
    base: ImageBase,
    owner: String,
    package: String,
    escaped_package: String,
    owner_type: OwnerType,
    token: String,
}

impl GhcrClient {
    pub fn new(
        base: ImageBase,
        token: String,
        owner_type: OwnerType,
    ) -> Result<Self, RegistryError> {
        let (owner, package) = base
            .ghcr_owner_and_package()
            .map_err(|e| RegistryError::Reference(e.to_string()))?;
        let (owner, package) = (owner.to_string(), package.to_string());
        let escaped_package = base
            .ghcr_escaped_package()
            .map_err(|e| RegistryError::Reference(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base,
            owner,
            package,
            escaped_package,
            owner_type,
            token,
        })
    }

    fn versions_url(&self) -> String {
        format!(
            "https://api.github.com/{}/{}/packages/container/{}/versions",
            self.owner_type.as_str(),
            self.owner,
            self.escaped_package
        )
    }
}

#[async_trait]
impl RegistryClient for GhcrClient {
    async fn latest_tag(&self) -> Result<Option<String>, RegistryError> {
        let response = self
            .http
            .get(self.versions_url())
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RegistryError::from_status(
                status.as_u16(),
                &body,
                &format!(
                    "owner={}, package={} (owner type: {}); verify the package exists and the token has access",
                    self.owner,
                    self.package,
                    self.owner_type.as_str()
                ),
            ));
        }

        let versions: Vec<PackageVersion> =
            serde_json::from_str(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(select_latest(&versions))
    }

    async fn fetch(&self, tag: &str, dest: &Path) -> Result<(), RegistryError> {
        let reference = Reference::try_from(self.base.with_tag(tag).as_str())
            .map_err(|e| RegistryError::Reference(e.to_string()))?;
        tracing::info!(%reference, "pulling OCI image layers");

        let client = OciClient::new(ClientConfig::default());
        let auth = RegistryAuth::Basic(self.owner.clone(), self.token.clone());
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

        let mut written = 0usize;
        for (index, layer) in image.layers.iter().enumerate() {
            if layer.data.is_empty() {
                tracing::debug!(index, "layer is empty, skipping");
                continue;
            }
            let file = dest.join(layer_file_name(&layer.media_type, index));
            std::fs::write(&file, &layer.data)?;
            tracing::debug!(file = %file.display(), bytes = layer.data.len(), "saved layer");
            written += 1;
        }
        if written == 0 {
            tracing::warn!(%reference, "no files were extracted from the image");
        }
        Ok(())
    }
}

/// Policy layers get a `policy-` prefix so they are recognizable on disk;
/// everything else is named by its layer index.
fn layer_file_name(media_type: &str, index: usize) -> String {
    if media_type == POLICY_LAYER_MEDIA_TYPE {
        format!("policy-{index}.yaml")
    } else {
        format!("layer-{index}.yaml")
    }
}
