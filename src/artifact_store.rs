use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{QueueError, QueueResult},
    models::{Manifest, ViewType},
};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const PREVIEW_FILE_NAME: &str = "preview.png";

/// Top-level directories under the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Models,
    MultiView,
}

impl StorageArea {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Models => "3d-models",
            Self::MultiView => "3d-multiview",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub local_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub file_count: u64,
    pub total_bytes: u64,
    pub user_count: u64,
}

/// Extension a downloaded file gets for the provider-declared type. Unknown
/// types keep their lower-cased name only when it is plain alphanumeric.
pub fn extension_for(file_type: &str) -> String {
    match file_type.to_ascii_uppercase().as_str() {
        "GLB" => "glb".to_string(),
        "OBJ" => "obj".to_string(),
        "STL" => "stl".to_string(),
        "USDZ" => "usdz".to_string(),
        "FBX" => "fbx".to_string(),
        "MP4" => "mp4".to_string(),
        "GIF" => "gif".to_string(),
        _ if !file_type.is_empty() && file_type.chars().all(|c| c.is_ascii_alphanumeric()) => {
            file_type.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

/// `model.{ext}` for the first result, `model-{index}.{ext}` after that, so
/// two results of the same type never share a file.
pub fn model_file_name(file_type: &str, index: usize) -> String {
    let ext = extension_for(file_type);
    if index == 0 {
        format!("model.{ext}")
    } else {
        format!("model-{index}.{ext}")
    }
}

/// Rejects anything that could escape its directory when joined onto a path.
pub fn validate_component(value: &str) -> QueueResult<&str> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
        || value.starts_with('.');
    if bad {
        return Err(QueueError::InvalidPathComponent(value.to_string()));
    }
    Ok(value)
}

/// Client for artifact downloads. Bounds connecting and each read, never the
/// whole transfer, so a large model that keeps streaming is not cut off.
pub fn download_client(
    connect_timeout: Duration,
    idle_timeout: Duration,
) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(idle_timeout)
        .build()
        .context("Failed to build download client")
}

/// Durable local copies of provider results, one directory per record.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    public_base: String,
    http: reqwest::Client,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base: &str, http: reqwest::Client) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        for area in [StorageArea::Models, StorageArea::MultiView] {
            let dir = self.root.join(area.dir_name());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create storage root at {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn record_dir(&self, area: StorageArea, user_uuid: &str, record_uuid: Uuid) -> QueueResult<PathBuf> {
        Ok(self
            .root
            .join(area.dir_name())
            .join(validate_component(user_uuid)?)
            .join(record_uuid.to_string()))
    }

    pub fn public_url(
        &self,
        area: StorageArea,
        user_uuid: &str,
        record_uuid: Uuid,
        file_name: &str,
    ) -> String {
        format!(
            "{}/{}/{user_uuid}/{record_uuid}/{file_name}",
            self.public_base,
            area.dir_name()
        )
    }

    /// Path of a stored file for the serving layer. The file may not exist.
    pub fn resolve_file(
        &self,
        area: StorageArea,
        user_uuid: &str,
        record_uuid: Uuid,
        file_name: &str,
    ) -> QueueResult<PathBuf> {
        let dir = self.record_dir(area, user_uuid, record_uuid)?;
        Ok(dir.join(validate_component(file_name)?))
    }

    /// Streams the `index`th result into the record directory. A partial
    /// file is removed before the error is returned.
    pub async fn download_file(
        &self,
        url: &str,
        user_uuid: &str,
        record_uuid: Uuid,
        file_type: &str,
        index: usize,
    ) -> QueueResult<StoredFile> {
        let file_name = model_file_name(file_type, index);
        self.fetch_to(url, user_uuid, record_uuid, &file_name).await
    }

    /// Preview images are optional; any failure yields `None`.
    pub async fn download_preview(
        &self,
        url: &str,
        user_uuid: &str,
        record_uuid: Uuid,
    ) -> Option<StoredFile> {
        match self
            .fetch_to(url, user_uuid, record_uuid, PREVIEW_FILE_NAME)
            .await
        {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(record_uuid = %record_uuid, "Preview download skipped: {err}");
                None
            }
        }
    }

    async fn fetch_to(
        &self,
        url: &str,
        user_uuid: &str,
        record_uuid: Uuid,
        file_name: &str,
    ) -> QueueResult<StoredFile> {
        let dir = self.record_dir(StorageArea::Models, user_uuid, record_uuid)?;
        let path = dir.join(validate_component(file_name)?);
        fs::create_dir_all(&dir).await?;

        let failed = |reason: String| QueueError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }

        let mut file = fs::File::create(&path).await?;
        let mut size_bytes = 0u64;
        let written: QueueResult<()> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|err| failed(err.to_string()))?
            {
                file.write_all(&chunk).await?;
                size_bytes += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(err) = written {
            drop(file);
            if let Err(cleanup) = delete_file_if_exists(&path).await {
                warn!(path = %path.display(), "Failed to remove partial download: {cleanup}");
            }
            return Err(err);
        }

        info!(
            record_uuid = %record_uuid,
            file_name,
            size_bytes,
            "Stored generated file"
        );
        Ok(StoredFile {
            local_path: path,
            file_name: file_name.to_string(),
            size_bytes,
        })
    }

    /// Writes `manifest.json` next to the record's files. Best-effort.
    pub async fn save_manifest(&self, user_uuid: &str, record_uuid: Uuid, manifest: &Manifest) {
        let result: QueueResult<()> = async {
            let dir = self.record_dir(StorageArea::Models, user_uuid, record_uuid)?;
            fs::create_dir_all(&dir).await?;
            let body = serde_json::to_vec_pretty(manifest)?;
            fs::write(dir.join(MANIFEST_FILE_NAME), body).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(record_uuid = %record_uuid, "Failed to write manifest: {err}");
        }
    }

    /// Removes every stored file of the record. Missing directories are fine.
    pub async fn delete_all(&self, user_uuid: &str, record_uuid: Uuid) -> QueueResult<u64> {
        let mut freed = 0;
        for area in [StorageArea::Models, StorageArea::MultiView] {
            let dir = self.record_dir(area, user_uuid, record_uuid)?;
            freed += directory_size(&dir).await?;
            delete_dir_if_exists(&dir).await?;
        }
        Ok(freed)
    }

    /// Decodes an inline auxiliary view image and returns the URL it will be
    /// served from.
    pub async fn save_multiview_image(
        &self,
        user_uuid: &str,
        record_uuid: Uuid,
        view: ViewType,
        data: &str,
    ) -> QueueResult<String> {
        let payload = data
            .split_once(";base64,")
            .map(|(_, rest)| rest)
            .unwrap_or(data);
        let bytes = STANDARD.decode(payload.trim()).map_err(|err| {
            QueueError::InvalidParams(format!("{} view image is not valid base64: {err}", view.as_str()))
        })?;

        let dir = self.record_dir(StorageArea::MultiView, user_uuid, record_uuid)?;
        fs::create_dir_all(&dir).await?;
        let file_name = format!("{}.png", view.as_str());
        fs::write(dir.join(&file_name), bytes).await?;

        Ok(self.public_url(StorageArea::MultiView, user_uuid, record_uuid, &file_name))
    }

    pub async fn storage_stats(&self) -> QueueResult<StorageStats> {
        let models = self.root.join(StorageArea::Models.dir_name());
        let mut stats = StorageStats::default();

        let mut users = match fs::read_dir(&models).await {
            Ok(users) => users,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(err) => return Err(err.into()),
        };
        while let Some(user) = users.next_entry().await? {
            if !user.file_type().await?.is_dir() {
                continue;
            }
            stats.user_count += 1;
            let (files, bytes) = walk(&user.path()).await?;
            stats.file_count += files;
            stats.total_bytes += bytes;
        }
        Ok(stats)
    }
}

async fn walk(dir: &Path) -> QueueResult<(u64, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                files += 1;
                bytes += meta.len();
            }
        }
    }
    Ok((files, bytes))
}

pub async fn directory_size(dir: &Path) -> QueueResult<u64> {
    Ok(walk(dir).await?.1)
}

pub async fn delete_dir_if_exists(path: &Path) -> QueueResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub async fn delete_file_if_exists(path: &Path) -> QueueResult<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
pub mod testing {
    use axum::Router;

    /// Serves `router` on an ephemeral local port and returns its base URL.
    pub async fn spawn_file_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve test files");
        });
        format!("http://{addr}")
    }
}
