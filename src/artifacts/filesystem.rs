//! Artifact provider backed by a local directory tree.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;

use crate::artifacts::copy::copy_cancellable;
use crate::artifacts::item::{
    ArtifactItem, DESTINATION_URL_KEY, DOWNLOAD_URL_KEY, SYMLINK_TARGET_KEY,
};
use crate::artifacts::provider::{ArtifactProvider, ArtifactStream};
use crate::error::ArtifactError;

/// Reads and writes artifacts under a root directory.
///
/// Writes land at `root/<item.path>`. Missing ancestor directories are
/// created on demand; the provider remembers which ones it already ensured
/// so repeated writes into the same folder skip the filesystem check. The
/// memo is per instance and can be turned off without changing behaviour:
/// a remembered directory that has since been removed is forgotten and
/// created again.
///
/// Symbolic links are listed as leaves tagged with [`SYMLINK_TARGET_KEY`]
/// and are never read through.
pub struct FilesystemProvider {
    root: PathBuf,
    created_dirs: Option<Mutex<HashSet<PathBuf>>>,
}

impl FilesystemProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created_dirs: Some(Mutex::new(HashSet::new())),
        }
    }

    /// Enable or disable the ensured-directory memo.
    pub fn with_directory_cache(mut self, enabled: bool) -> Self {
        self.created_dirs = enabled.then(|| Mutex::new(HashSet::new()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make sure `dir` and all its ancestors exist.
    ///
    /// Safe to call concurrently for overlapping paths: a directory created
    /// by someone else between the check and the create is not an error.
    pub async fn ensure_directory(&self, dir: &Path) -> Result<(), ArtifactError> {
        if self.is_known_directory(dir) {
            return Ok(());
        }

        if let Err(source) = tokio::fs::create_dir_all(dir).await {
            let exists_as_dir = tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if source.kind() != std::io::ErrorKind::AlreadyExists || !exists_as_dir {
                return Err(ArtifactError::CreateDirectory {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        }

        if let Some(cache) = &self.created_dirs {
            cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(dir.to_path_buf());
        }
        Ok(())
    }

    /// Drop `dir` from the memo. Returns whether it was remembered.
    fn forget_directory(&self, dir: &Path) -> bool {
        self.created_dirs.as_ref().is_some_and(|cache| {
            cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(dir)
        })
    }

    fn is_known_directory(&self, dir: &Path) -> bool {
        self.created_dirs.as_ref().is_some_and(|cache| {
            cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(dir)
        })
    }

    /// Destination for a relative artifact path, refusing anything that
    /// would escape the root.
    fn destination_for(&self, relative: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = |reason: &str| ArtifactError::InvalidPath {
            path: relative.to_string(),
            reason: reason.to_string(),
        };

        if relative.starts_with('/') || relative.starts_with('\\') {
            return Err(invalid("absolute paths are not allowed"));
        }

        let mut dest = self.root.clone();
        let mut segments = 0usize;
        for part in relative.split(['/', '\\']) {
            if part.is_empty() || part == "." {
                continue;
            }
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(segment)), None) => dest.push(segment),
                (Some(Component::ParentDir), None) => {
                    return Err(invalid("parent directory segments are not allowed"));
                }
                _ => return Err(invalid("unsupported path segment")),
            }
            segments += 1;
        }

        if segments == 0 {
            return Err(invalid("path is empty"));
        }
        Ok(dest)
    }

    /// Create the temp file, recreating `folder` once if a remembered
    /// directory turns out to be gone.
    async fn create_temp(
        &self,
        temp: &Path,
        folder: &Path,
        item_path: &str,
    ) -> Result<tokio::fs::File, ArtifactError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);

        let opened = match options.open(temp).await {
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound && self.forget_directory(folder) =>
            {
                tracing::debug!(
                    folder = %folder.display(),
                    "Remembered directory is gone, creating it again"
                );
                self.ensure_directory(folder).await?;
                options.open(temp).await
            }
            other => other,
        };
        opened.map_err(|source| ArtifactError::Stream {
            path: item_path.to_string(),
            source,
        })
    }

    async fn write_via_temp(
        &self,
        file: tokio::fs::File,
        temp: &Path,
        dest: &Path,
        stream: &mut ArtifactStream,
        item_path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ArtifactError> {
        let stream_err = |source: std::io::Error| ArtifactError::Stream {
            path: item_path.to_string(),
            source,
        };

        let mut writer = BufWriter::new(file);
        let bytes = copy_cancellable(stream, &mut writer, item_path, cancel).await?;

        let file = writer.into_inner();
        file.sync_all().await.map_err(stream_err)?;
        drop(file);

        tokio::fs::rename(temp, dest).await.map_err(stream_err)?;
        Ok(bytes)
    }
}

fn download_path(item: &ArtifactItem) -> Result<PathBuf, ArtifactError> {
    item.download_url()
        .map(PathBuf::from)
        .ok_or_else(|| ArtifactError::MissingMetadata {
            path: item.path.clone(),
            key: DOWNLOAD_URL_KEY.to_string(),
        })
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    dest.with_file_name(format!(
        ".{}.partial-{}",
        name,
        uuid::Uuid::new_v4().simple()
    ))
}

#[async_trait]
impl ArtifactProvider for FilesystemProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get_root_items(&self) -> Result<Vec<ArtifactItem>, ArtifactError> {
        Ok(vec![ArtifactItem::folder(
            "",
            self.root.to_string_lossy().into_owned(),
        )])
    }

    async fn get_artifact_items(
        &self,
        item: &ArtifactItem,
    ) -> Result<Vec<ArtifactItem>, ArtifactError> {
        if !item.is_folder() {
            return Err(ArtifactError::NotAFolder {
                path: item.path.clone(),
            });
        }
        let dir = download_path(item)?;

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|source| {
            tracing::warn!("Unable to read directory {}: {}", dir.display(), source);
            ArtifactError::Enumeration {
                path: dir.clone(),
                source,
            }
        })?;

        let mut items = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(ArtifactError::Enumeration {
                        path: dir.clone(),
                        source,
                    });
                }
            };
            let child = entry.path();

            // lstat: a symlink is a leaf and is never enumerated as a folder.
            let meta = tokio::fs::symlink_metadata(&child)
                .await
                .map_err(|source| ArtifactError::Enumeration {
                    path: child.clone(),
                    source,
                })?;

            let name = entry.file_name().to_string_lossy().into_owned();
            let path = item.child_path(&name);
            let url = child.to_string_lossy();

            let mut child_item = if meta.is_dir() {
                ArtifactItem::folder(path, url)
            } else {
                let mut file = ArtifactItem::file(path, url);
                file.file_length = Some(meta.len());
                if meta.file_type().is_symlink() {
                    let target = tokio::fs::read_link(&child).await.map_err(|source| {
                        ArtifactError::Enumeration {
                            path: child.clone(),
                            source,
                        }
                    })?;
                    file.metadata.insert(
                        SYMLINK_TARGET_KEY.to_string(),
                        target.to_string_lossy().into_owned(),
                    );
                }
                file
            };
            child_item.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
            items.push(child_item);
        }

        tracing::debug!(
            folder = %item.path,
            count = items.len(),
            "Enumerated artifact folder"
        );
        Ok(items)
    }

    async fn get_artifact_item(
        &self,
        item: &ArtifactItem,
    ) -> Result<ArtifactStream, ArtifactError> {
        let path = download_path(item)?;
        let open_err = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound {
                    path: item.path.clone(),
                }
            } else {
                ArtifactError::Stream {
                    path: item.path.clone(),
                    source,
                }
            }
        };

        let meta = tokio::fs::symlink_metadata(&path).await.map_err(open_err)?;
        if meta.file_type().is_symlink() {
            return Err(ArtifactError::Unsupported {
                path: item.path.clone(),
                reason: "symbolic links are not read through".to_string(),
            });
        }
        if meta.is_dir() {
            return Err(ArtifactError::Unsupported {
                path: item.path.clone(),
                reason: "folders have no content stream".to_string(),
            });
        }

        let file = tokio::fs::File::open(&path).await.map_err(open_err)?;
        Ok(Box::new(file))
    }

    async fn put_artifact_item(
        &self,
        mut item: ArtifactItem,
        mut stream: ArtifactStream,
        cancel: &CancellationToken,
    ) -> Result<ArtifactItem, ArtifactError> {
        let dest = self.destination_for(&item.path)?;
        let folder = dest.parent().unwrap_or(&self.root);
        self.ensure_directory(folder).await?;

        tracing::debug!("Downloading {} to {}", item.path, dest.display());

        let temp = temp_path_for(&dest);
        let file = self.create_temp(&temp, folder, &item.path).await?;
        let bytes = match self
            .write_via_temp(file, &temp, &dest, &mut stream, &item.path, cancel)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&temp).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(
                        "Failed to remove partial file {}: {}",
                        temp.display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(bytes, "Downloaded '{}' to '{}'", item.path, dest.display());

        item.file_length = Some(bytes);
        item.metadata.insert(
            DESTINATION_URL_KEY.to_string(),
            dest.to_string_lossy().into_owned(),
        );
        Ok(item)
    }
}
