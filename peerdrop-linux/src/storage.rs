//! Filesystem storage: relative paths resolve under a root directory,
//! absolute paths are used as given (files named on the command line).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use peerdrop_core::{Storage, StorageError};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let p = Path::new(path);
        if p.is_absolute() {
            return Ok(p.to_path_buf());
        }
        if p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(p))
    }
}

fn map_io(path: &str, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn read_binary(&self, path: &str) -> Result<Bytes, StorageError> {
        let full = self.resolve(path)?;
        let data = tokio::fs::read(&full).await.map_err(|e| map_io(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn create_binary(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn ensure_folder(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    /// Regular files under `folder`, sorted, named as `folder/<relative>`.
    async fn list_files(&self, folder: &str) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(folder)?;
        let folder = folder.trim_end_matches('/').to_string();
        let listed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&full).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    StorageError::Io(e.into_io_error().unwrap_or_else(|| ErrorKind::Other.into()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&full) else {
                    continue;
                };
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(format!("{}/{}", folder, rel.join("/")));
            }
            Ok::<_, StorageError>(out)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(ErrorKind::Other, e)))??;
        Ok(listed)
    }
}
