#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("authentication failed (401): invalid or expired registry credentials")]
    Unauthorized,
    #[error("access forbidden (403): credentials may lack required permissions (read:packages): {0}")]
    Forbidden(String),
    #[error("not found (404): {0}")]
    NotFound(String),
    #[error("registry API returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to parse registry response: {0}")]
    Decode(String),
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OCI pull failed: {0}")]
    Pull(#[from] oci_distribution::errors::OciDistributionError),
    #[error("invalid image reference: {0}")]
    Reference(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Maps a non-success registry response to an error kind. `detail` is the
    /// caller's context for 404s, where the response body is rarely useful.
    pub(crate) fn from_status(status: u16, body: &str, detail: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message")?.as_str().map(String::from))
            .unwrap_or_else(|| body.chars().take(200).collect());
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden(message),
            404 => Self::NotFound(detail.to_string()),
            _ => Self::Api { status, message },
        }
    }
}
