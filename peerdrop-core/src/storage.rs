//! Storage collaborator and the save-path rules applied on top of it.
//!
//! Paths are `/`-separated and relative to the storage root.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::chunk::ReceivedFile;
use crate::protocol::FileDescriptor;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_binary(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Create a new file. Fails with `AlreadyExists` if `path` is taken.
    async fn create_binary(&self, path: &str, data: Bytes) -> Result<(), StorageError>;

    /// Create `path` and its parents if missing.
    async fn ensure_folder(&self, path: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Every file below `folder`, recursively, in a stable order.
    async fn list_files(&self, folder: &str) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("no free name for {path} after {attempts} attempts")]
    NoFreeName { path: String, attempts: u32 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME type by file extension; unknown extensions are octet streams.
pub fn mime_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" => "text/markdown",
        "txt" => "text/plain",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Last component of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Describe a file about to be sent. With `base`, the relative path is the
/// part of `path` below it.
pub fn describe(path: &str, size: u64, base: Option<&str>) -> FileDescriptor {
    let name = file_name(path);
    let relative_path = base.and_then(|base| {
        let base = base.trim_end_matches('/');
        if base.is_empty() {
            return Some(path.to_string());
        }
        path.strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    });
    FileDescriptor {
        name: name.to_string(),
        mime_type: mime_type_for(name).to_string(),
        size,
        relative_path,
    }
}

/// The parent folder of `path`, empty at the root.
pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub fn join(folder: &str, rest: &str) -> String {
    let folder = folder.trim_end_matches('/');
    if folder.is_empty() {
        rest.to_string()
    } else {
        format!("{folder}/{rest}")
    }
}

/// `n`-th name candidate: `photo.png`, `photo (1).png`, `photo (2).png`, ...
pub fn unique_candidate(path: &str, n: u32) -> String {
    if n == 0 {
        return path.to_string();
    }
    let dir = parent(path);
    let name = file_name(path);
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    };
    join(dir, &renamed)
}

/// Normalize a peer-supplied relative path. Rejects absolute paths, drive
/// prefixes and `..`. Colons elsewhere in a name are kept.
pub fn sanitize_relative(path: &str) -> Result<String, StorageError> {
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidPath(path.to_string())),
            part if is_drive_prefix(part) => {
                return Err(StorageError::InvalidPath(path.to_string()))
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// A bare drive component such as `C:`.
fn is_drive_prefix(part: &str) -> bool {
    matches!(part.as_bytes(), [letter, b':'] if letter.is_ascii_alphabetic())
}

/// Write a received file under `folder`, keeping its relative path and
/// picking the first free name. Returns the path written.
pub async fn save_received_file(
    storage: &dyn Storage,
    folder: &str,
    file: &ReceivedFile,
    max_attempts: u32,
) -> Result<String, StorageError> {
    let relative = file
        .descriptor
        .relative_path
        .as_deref()
        .unwrap_or(&file.descriptor.name);
    let target = join(folder, &sanitize_relative(relative)?);
    let dir = parent(&target);
    if !dir.is_empty() {
        storage.ensure_folder(dir).await?;
    }
    for n in 0..max_attempts {
        let candidate = unique_candidate(&target, n);
        if storage.exists(&candidate).await? {
            continue;
        }
        match storage.create_binary(&candidate, file.data.clone()).await {
            Ok(()) => return Ok(candidate),
            Err(StorageError::AlreadyExists(_)) => {
                debug!(path = %candidate, "name taken while saving, trying next");
            }
            Err(e) => return Err(e),
        }
    }
    Err(StorageError::NoFreeName {
        path: target,
        attempts: max_attempts,
    })
}

/// In-memory storage, for tests and hosts that keep files themselves.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    files: BTreeMap<String, Bytes>,
    folders: BTreeSet<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, data: impl Into<Bytes>) {
        self.lock().files.insert(path.to_string(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.lock().files.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_binary(&self, path: &str) -> Result<Bytes, StorageError> {
        self.get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn create_binary(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.files.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        inner.files.insert(path.to_string(), data);
        Ok(())
    }

    async fn ensure_folder(&self, path: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            inner.folders.insert(current.clone());
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let inner = self.lock();
        Ok(inner.files.contains_key(path) || inner.folders.contains(path))
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", folder.trim_end_matches('/'));
        Ok(self
            .lock()
            .files
            .keys()
            .filter(|p| prefix == "/" || p.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(name: &str, path: Option<&str>) -> ReceivedFile {
        ReceivedFile {
            descriptor: FileDescriptor {
                name: name.into(),
                mime_type: mime_type_for(name).into(),
                size: 3,
                relative_path: path.map(str::to_string),
            },
            data: Bytes::from_static(b"abc"),
        }
    }

    /// Reports every name as free, so collisions only surface on create.
    struct Racy(MemoryStorage);

    #[async_trait]
    impl Storage for Racy {
        async fn read_binary(&self, path: &str) -> Result<Bytes, StorageError> {
            self.0.read_binary(path).await
        }
        async fn create_binary(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
            self.0.create_binary(path, data).await
        }
        async fn ensure_folder(&self, path: &str) -> Result<(), StorageError> {
            self.0.ensure_folder(path).await
        }
        async fn exists(&self, _path: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn list_files(&self, folder: &str) -> Result<Vec<String>, StorageError> {
            self.0.list_files(folder).await
        }
    }

    #[test]
    fn candidates_insert_counter_before_extension() {
        assert_eq!(unique_candidate("PeerDrop/photo.png", 0), "PeerDrop/photo.png");
        assert_eq!(unique_candidate("PeerDrop/photo.png", 2), "PeerDrop/photo (2).png");
        assert_eq!(unique_candidate("README", 1), "README (1)");
        assert_eq!(unique_candidate(".env", 1), ".env (1)");
        assert_eq!(unique_candidate("a/b.tar.gz", 1), "a/b.tar (1).gz");
    }

    #[test]
    fn mime_and_relative_paths() {
        let d = describe("docs/notes/today.MD", 5, Some("docs"));
        assert_eq!(d.name, "today.MD");
        assert_eq!(d.mime_type, "text/markdown");
        assert_eq!(d.relative_path.as_deref(), Some("notes/today.MD"));
        assert_eq!(describe("x.bin", 1, None).mime_type, "application/octet-stream");
        assert_eq!(describe("x.bin", 1, None).relative_path, None);
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(sanitize_relative("../etc/passwd").is_err());
        assert!(sanitize_relative("a/../../b").is_err());
        assert!(sanitize_relative("/abs").is_err());
        assert!(sanitize_relative("C:\\x").is_err());
        assert!(sanitize_relative("C:/x").is_err());
        assert!(sanitize_relative("a/d:/b").is_err());
        assert_eq!(sanitize_relative("./a//b\\c.txt").unwrap(), "a/b/c.txt");
    }

    #[tokio::test]
    async fn collisions_get_numbered() {
        let storage = MemoryStorage::new();
        storage.insert("PeerDrop/a.txt", Bytes::from_static(b"old"));
        let path = save_received_file(&storage, "PeerDrop", &received("a.txt", None), 100)
            .await
            .unwrap();
        assert_eq!(path, "PeerDrop/a (1).txt");
        assert_eq!(storage.get("PeerDrop/a.txt").unwrap(), Bytes::from_static(b"old"));
        assert_eq!(storage.get(&path).unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn relative_path_creates_folders() {
        let storage = MemoryStorage::new();
        let path = save_received_file(
            &storage,
            "PeerDrop",
            &received("b.txt", Some("trip/day1/b.txt")),
            100,
        )
        .await
        .unwrap();
        assert_eq!(path, "PeerDrop/trip/day1/b.txt");
        assert!(storage.exists("PeerDrop/trip/day1").await.unwrap());
        assert_eq!(storage.list_files("PeerDrop/trip").await.unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn create_race_retries_then_gives_up() {
        let storage = Racy(MemoryStorage::new());
        storage.0.insert("a.txt", Bytes::new());
        storage.0.insert("a (1).txt", Bytes::new());
        let path = save_received_file(&storage, "", &received("a.txt", None), 5)
            .await
            .unwrap();
        assert_eq!(path, "a (2).txt");

        let err = save_received_file(&storage, "", &received("a.txt", None), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NoFreeName { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn colons_in_names_are_kept() {
        assert_eq!(sanitize_relative("logs/12:30 notes.txt").unwrap(), "logs/12:30 notes.txt");
        let storage = MemoryStorage::new();
        let path = save_received_file(&storage, "PeerDrop", &received("12:30 notes.txt", None), 100)
            .await
            .unwrap();
        assert_eq!(path, "PeerDrop/12:30 notes.txt");
        let path = save_received_file(
            &storage,
            "PeerDrop",
            &received("a:b.txt", Some("meeting 09:00/a:b.txt")),
            100,
        )
        .await
        .unwrap();
        assert_eq!(path, "PeerDrop/meeting 09:00/a:b.txt");
    }

    #[tokio::test]
    async fn traversal_never_touches_storage() {
        let storage = MemoryStorage::new();
        let err = save_received_file(&storage, "PeerDrop", &received("x", Some("../x")), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        assert!(storage.paths().is_empty());
    }
}
