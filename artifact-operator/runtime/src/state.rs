use std::path::PathBuf;

use kyverno_artifact_operator_core::sanitize_tag;

const LAST_FILE: &str = "last_seen";

/// Per-worker on-disk state: the last successfully applied tag and the
/// per-tag scratch directories, rooted in one directory the pod owns
/// exclusively.
pub struct TagStore {
    dir: PathBuf,
}

impl TagStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn open_default() -> std::io::Result<Self> {
        Self::open(std::env::temp_dir().join("kyverno-watcher"))
    }

    /// The last applied tag. A missing or blank file means no tag has been
    /// applied yet.
    pub fn last_applied(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.last_file()).ok()?;
        let tag = raw.trim();
        if tag.is_empty() {
            None
        } else {
            Some(tag.to_string())
        }
    }

    /// Records the applied tag, replacing the bookmark atomically.
    pub fn record(&self, tag: &str) -> std::io::Result<()> {
        let staged = self.dir.join(format!("{LAST_FILE}.tmp"));
        std::fs::write(&staged, tag)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o644))?;
        }
        std::fs::rename(staged, self.last_file())
    }

    /// Scratch directory for one pulled tag. The pull pipeline recreates it
    /// empty on every pull.
    pub fn scratch_dir(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("image-{}", sanitize_tag(tag)))
    }

    fn last_file(&self) -> PathBuf {
        self.dir.join(LAST_FILE)
    }

    #[cfg(test)]
    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}
