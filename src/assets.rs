//! Image replication for menu data.
//!
//! Images referenced by categories and items are mirrored into `uploads/`
//! and tracked in `image-sync.json`. A cached file is trusted only while its
//! SHA-256 still matches the recorded hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

use crate::api::AssetSource;
use crate::db::LocalStore;
use crate::error::{CoreError, Result};
use crate::model::AssetRecord;

/// Prefix of references that point into the local asset directory.
pub const LOCAL_PREFIX: &str = "uploads/";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    images: BTreeMap<String, AssetRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSyncReport {
    pub referenced: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub local: usize,
    pub failed: usize,
    pub removed: usize,
}

enum AssetOutcome {
    Local(String),
    CacheHit(String),
    Downloaded(String),
    Failed,
}

pub struct AssetReplicator {
    source: Arc<dyn AssetSource>,
    local: Arc<LocalStore>,
    asset_dir: PathBuf,
    manifest_path: PathBuf,
    base_url: String,
    download_timeout: Duration,
    manifest_lock: Mutex<()>,
}

impl AssetReplicator {
    pub fn new(
        source: Arc<dyn AssetSource>,
        local: Arc<LocalStore>,
        asset_dir: PathBuf,
        manifest_path: PathBuf,
        base_url: &str,
        download_timeout: Duration,
    ) -> Self {
        Self {
            source,
            local,
            asset_dir,
            manifest_path,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_timeout,
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    /// Make the image behind `reference` available locally.
    ///
    /// Returns the local reference (`uploads/<file>`), or `None` when the
    /// image could not be fetched. A failed fetch never touches a
    /// previously cached file.
    pub async fn ensure_asset(&self, reference: &str) -> Option<String> {
        match self.replicate(reference).await {
            AssetOutcome::Local(path)
            | AssetOutcome::CacheHit(path)
            | AssetOutcome::Downloaded(path) => Some(path),
            AssetOutcome::Failed => None,
        }
    }

    /// Ensure every image the local menu references, then drop cached
    /// files nothing references any more.
    pub async fn sync_assets(&self) -> Result<AssetSyncReport> {
        let references = self.local.image_references()?;
        let mut report = AssetSyncReport {
            referenced: references.len(),
            ..Default::default()
        };
        info!(images = references.len(), "Starting image sync");

        for reference in &references {
            match self.replicate(reference).await {
                AssetOutcome::Local(_) => report.local += 1,
                AssetOutcome::CacheHit(_) => report.cached += 1,
                AssetOutcome::Downloaded(_) => report.downloaded += 1,
                AssetOutcome::Failed => report.failed += 1,
            }
        }

        let keep: HashSet<String> = references.iter().filter_map(|r| asset_filename(r)).collect();
        report.removed = self.collect_garbage(&keep).await?;

        info!(
            downloaded = report.downloaded,
            cached = report.cached,
            failed = report.failed,
            removed = report.removed,
            "Image sync completed"
        );
        Ok(report)
    }

    async fn replicate(&self, reference: &str) -> AssetOutcome {
        let reference = reference.trim();
        if reference.is_empty() {
            return AssetOutcome::Failed;
        }

        if let Some(rest) = reference.strip_prefix(LOCAL_PREFIX) {
            if fs::try_exists(self.asset_dir.join(rest)).await.unwrap_or(false) {
                debug!(reference, "Using local image");
                return AssetOutcome::Local(reference.to_string());
            }
        }

        let url = resolve_url(&self.base_url, reference);
        let Some(filename) = asset_filename(&url) else {
            warn!(reference, "Image reference has no usable filename");
            return AssetOutcome::Failed;
        };
        let target = self.asset_dir.join(&filename);
        let local_ref = format!("{LOCAL_PREFIX}{filename}");

        let cached = {
            let _guard = self.manifest_lock.lock().await;
            self.load_manifest().await.images.remove(&filename)
        };

        if let Some(record) = cached {
            if record.url != url {
                info!(filename = %filename, "Cached image came from another URL, re-downloading");
            } else if fs::try_exists(&target).await.unwrap_or(false) {
                match hash_file(&target).await {
                    Ok((hash, _)) if hash == record.hash => {
                        debug!(filename = %filename, "Image already cached and valid");
                        return AssetOutcome::CacheHit(local_ref);
                    }
                    Ok(_) => info!(filename = %filename, "Cached image hash mismatch, re-downloading"),
                    Err(e) => warn!(filename = %filename, "Error hashing cached image: {e}"),
                }
            }
        }

        match self.download(&url, &filename, &target).await {
            Ok((hash, size)) => {
                let record = AssetRecord {
                    url: url.clone(),
                    hash,
                    size,
                    last_sync: Utc::now(),
                };
                if let Err(e) = self.record_asset(&filename, record).await {
                    warn!("Failed to save image manifest: {e}");
                }
                info!(filename = %filename, bytes = size, "Image downloaded");
                AssetOutcome::Downloaded(local_ref)
            }
            Err(e) => {
                warn!(url = %url, "Failed to download image: {e}");
                AssetOutcome::Failed
            }
        }
    }

    async fn record_asset(&self, filename: &str, record: AssetRecord) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await;
        manifest.images.insert(filename.to_string(), record);
        self.save_manifest(&manifest).await
    }

    /// Download into a private `.part` file, hash it, then move it into place.
    async fn download(&self, url: &str, filename: &str, target: &Path) -> Result<(String, u64)> {
        fs::create_dir_all(&self.asset_dir).await?;
        let part = self
            .asset_dir
            .join(format!(".{filename}.{}.part", uuid::Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&part).await?;
            time::timeout(self.download_timeout, self.source.fetch_to(url, &mut file))
                .await
                .map_err(|_| {
                    CoreError::connectivity(format!(
                        "download timed out after {} ms",
                        self.download_timeout.as_millis()
                    ))
                })??;
            file.sync_all().await?;
            drop(file);
            let (hash, size) = hash_file(&part).await?;
            fs::rename(&part, target).await?;
            Ok::<_, CoreError>((hash, size))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&part).await;
        }
        result
    }

    /// Remove cached images whose name is not in `keep`, plus `.part` files
    /// left behind by downloads that never finished. Files this module did
    /// not download are left alone.
    async fn collect_garbage(&self, keep: &HashSet<String>) -> Result<usize> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await;
        let mut removed = HashSet::new();

        let stale: Vec<String> = manifest
            .images
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            manifest.images.remove(&name);
            let _ = fs::remove_file(self.asset_dir.join(&name)).await;
            removed.insert(name);
        }

        for name in &removed {
            info!(filename = %name, "Removed unused image");
        }

        // Parts younger than a download timeout may still be in flight
        let abandoned_after = self.download_timeout * 2;
        if let Ok(mut entries) = fs::read_dir(&self.asset_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !(name.starts_with('.') && name.ends_with(".part")) {
                    continue;
                }
                let age = entry
                    .metadata()
                    .await?
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok());
                if age.is_some_and(|age| age > abandoned_after) {
                    debug!(filename = %name, "Removing abandoned partial download");
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }

        manifest.last_sync = Some(Utc::now());
        self.save_manifest(&manifest).await?;
        Ok(removed.len())
    }

    async fn load_manifest(&self) -> Manifest {
        match fs::read(&self.manifest_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Image manifest unreadable, starting fresh: {e}");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        }
    }

    /// Write to a sibling temp file, then rename over the manifest.
    async fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        if let Some(parent) = self.manifest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.manifest_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
        fs::rename(&tmp, &self.manifest_path).await?;
        Ok(())
    }
}

/// Absolute URLs are used as-is; anything else is relative to the backend.
pub fn resolve_url(base_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else {
        format!("{base_url}/{}", reference.trim_start_matches('/'))
    }
}

/// Last path segment without query string or fragment. Hidden and
/// traversal names are rejected.
pub fn asset_filename(reference: &str) -> Option<String> {
    let path = reference.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default().trim();
    if name.is_empty() || name.starts_with('.') || name.contains('\\') {
        None
    } else {
        Some(name.to_string())
    }
}

async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
