use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use egw_core::GameId;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::http::HttpFetcher;

/// Image cache collaborator. Failures never escape: they come back as `None`.
#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Download `url` for `game_id` and return the local reference.
    async fn fetch(&self, url: &str, game_id: GameId) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    /// Local reference persisted in the game row, relative to the cache root.
    pub local_ref: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The same bytes were already cached under this reference.
    pub deduplicated: bool,
}

/// Extension of the last path segment of `url`, lowercased; `jpg` when the
/// url has none or it looks bogus.
pub fn extension_from_url(url: &str) -> String {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    let segment = path.rsplit('/').next().unwrap_or_default();
    match segment.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "jpg".to_string(),
    }
}

/// Images stored as `<root>/<game_id>.<ext>`, written through a temp file and
/// an atomic rename.
#[derive(Debug, Clone)]
pub struct FsImageCache {
    root: PathBuf,
    http: Arc<HttpFetcher>,
}

impl FsImageCache {
    pub fn new(root: impl Into<PathBuf>, http: Arc<HttpFetcher>) -> Self {
        Self {
            root: root.into(),
            http,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a local reference previously returned by `fetch`.
    pub fn resolve(&self, local_ref: &str) -> PathBuf {
        self.root.join(local_ref)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn store_bytes(
        &self,
        game_id: GameId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredImage> {
        let content_hash = Self::sha256_hex(bytes);
        let local_ref = format!("{game_id}.{extension}");
        let absolute_path = self.root.join(&local_ref);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating image directory {}", self.root.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading cached image {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredImage {
                    local_ref,
                    content_hash,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp image {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredImage {
            local_ref,
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

#[async_trait]
impl ImageCache for FsImageCache {
    async fn fetch(&self, url: &str, game_id: GameId) -> Option<String> {
        let response = match self.http.fetch_bytes(url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(game_id, url, error = %err, "image download failed");
                return None;
            }
        };

        match self
            .store_bytes(game_id, &extension_from_url(url), &response.body)
            .await
        {
            Ok(stored) => {
                info!(
                    game_id,
                    local_ref = %stored.local_ref,
                    bytes = stored.byte_size,
                    deduplicated = stored.deduplicated,
                    "image cached"
                );
                Some(stored.local_ref)
            }
            Err(err) => {
                warn!(game_id, url, error = %err, "image cache write failed");
                None
            }
        }
    }
}
