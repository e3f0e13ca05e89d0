use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// A file a worker left in a session's artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFile {
    pub name: String,
    pub size: u64,
    pub size_formatted: String,
    /// Last modification time.
    pub date: DateTime<Utc>,
    /// Download URL carrying the owning session's identifier.
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-session artifact directories under one root.
///
/// Every operation takes a session identifier and a bare file name; names
/// that are not a single normal path component are rejected before any
/// filesystem access.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `session_id`. Not created here.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(validate_name(session_id)?))
    }

    /// Create the session directory (and the root) if missing.
    pub async fn ensure_session_dir(&self, session_id: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// List regular files, newest first; ties broken by name.
    ///
    /// A session that has no directory yet has no artifacts.
    pub async fn list(&self, session_id: &str) -> Result<Vec<ArtifactFile>, ArtifactError> {
        let dir = self.session_dir(session_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // symlink_metadata: links are never listed, so they can't be served.
            let meta = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                // Deleted between readdir and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                tracing::debug!(path = %entry.path().display(), "skipping non-UTF-8 artifact name");
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(ArtifactFile {
                url: download_url(session_id, &name),
                size: meta.len(),
                size_formatted: format_bytes(meta.len()),
                date: DateTime::<Utc>::from(modified),
                name,
            });
        }

        files.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    /// Resolve `name` to an existing regular file inside the session directory.
    pub async fn resolve(&self, session_id: &str, name: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join(validate_name(name)?);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(ArtifactError::NotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one artifact.
    pub async fn delete(&self, session_id: &str, name: &str) -> Result<(), ArtifactError> {
        let path = self.resolve(session_id, name).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(session = %session_id, file = %name, "artifact deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole session directory. Missing directories are fine.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), ArtifactError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Accept only a single normal path component.
///
/// Rejects empty names, `.`/`..`, separators, absolute paths and NUL bytes.
pub fn validate_name(name: &str) -> Result<&str, ArtifactError> {
    let invalid = || ArtifactError::InvalidName(name.chars().take(64).collect());
    if name.is_empty() || name.contains(|c: char| matches!(c, '\0' | '/' | '\\')) {
        return Err(invalid());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(name),
        _ => Err(invalid()),
    }
}

/// Public URL for downloading `name` as `session_id`.
pub fn download_url(session_id: &str, name: &str) -> String {
    format!(
        "/downloads/{}?session={}",
        urlencoding::encode(name),
        urlencoding::encode(session_id)
    )
}

/// Human-readable byte count with base-1024 units, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.1}");
    let trimmed = rounded.strip_suffix(".0").unwrap_or(&rounded);
    format!("{} {}", trimmed, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_matches_expected_strings() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3 GB");
        assert_eq!(format_bytes(2048 * 1024 * 1024 * 1024), "2048 GB");
    }

    #[test]
    fn validate_name_rejects_traversal() {
        assert!(validate_name("report.zip").is_ok());
        assert!(validate_name("with space.pdf").is_ok());
        for bad in ["", ".", "..", "../x", "a/b", "/etc/passwd", "a\\b", "nul\0byte"] {
            assert!(
                matches!(validate_name(bad), Err(ArtifactError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn download_url_is_encoded() {
        assert_eq!(
            download_url("abc", "my file#1.zip"),
            "/downloads/my%20file%231.zip?session=abc"
        );
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        assert!(store.list("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_orders_newest_first_then_by_name() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.ensure_session_dir("s1").await.unwrap();

        let old = std::fs::File::create(dir.join("old.txt")).unwrap();
        old.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000))
            .unwrap();
        let newer = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(2_000);
        for name in ["b.txt", "a.txt"] {
            let f = std::fs::File::create(dir.join(name)).unwrap();
            f.set_modified(newer).unwrap();
        }
        std::fs::create_dir(dir.join("subdir")).unwrap();

        let names: Vec<String> = store
            .list("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "old.txt"]);
    }

    #[tokio::test]
    async fn list_reports_size_and_url() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.ensure_session_dir("s1").await.unwrap();
        std::fs::write(dir.join("data.bin"), vec![0u8; 1536]).unwrap();

        let files = store.list("s1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 1536);
        assert_eq!(files[0].size_formatted, "1.5 KB");
        assert_eq!(files[0].url, "/downloads/data.bin?session=s1");
    }

    #[tokio::test]
    async fn delete_existing_and_missing() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.ensure_session_dir("s1").await.unwrap();
        std::fs::write(dir.join("x.txt"), b"x").unwrap();

        store.delete("s1", "x.txt").await.unwrap();
        assert!(!dir.join("x.txt").exists());
        assert!(matches!(
            store.delete("s1", "x.txt").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let a = store.ensure_session_dir("a").await.unwrap();
        std::fs::write(a.join("secret.pdf"), b"A").unwrap();

        assert!(store.list("b").await.unwrap().is_empty());
        assert!(matches!(
            store.resolve("b", "secret.pdf").await,
            Err(ArtifactError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("b", "secret.pdf").await,
            Err(ArtifactError::NotFound(_))
        ));
        assert!(matches!(
            store.resolve("b", "../a/secret.pdf").await,
            Err(ArtifactError::InvalidName(_))
        ));
        assert!(a.join("secret.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_served() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("passwd"), b"root").unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.ensure_session_dir("s1").await.unwrap();
        std::os::unix::fs::symlink(outside.path().join("passwd"), dir.join("link")).unwrap();

        assert!(store.list("s1").await.unwrap().is_empty());
        assert!(matches!(
            store.resolve("s1", "link").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let dir = store.ensure_session_dir("s1").await.unwrap();
        std::fs::write(dir.join("f"), b"1").unwrap();

        store.remove_session("s1").await.unwrap();
        assert!(!dir.exists());
        store.remove_session("s1").await.unwrap();
    }
}
