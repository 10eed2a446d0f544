//! BinaryProvisioner - fetches and installs the node executable
//!
//! The artifact is streamed into `<binary>.download` next to the final path
//! and renamed into place only after the last byte is flushed, so the
//! installed path never holds a partial file. Progress is published per
//! chunk on [`CHANNEL_DOWNLOAD_PROGRESS`].

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use shared_types::{ChannelMessage, DownloadProgress, CHANNEL_DOWNLOAD_PROGRESS};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::channel::ChannelHub;
use crate::config::Config;
use crate::platform::Platform;

const TEMP_SUFFIX: &str = "download";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no published node binary for platform {0}")]
    UnsupportedPlatform(Platform),

    #[error("download transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download failed: {url} (HTTP {status})")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct BinaryProvisioner {
    install_home: PathBuf,
    binary_name: String,
    release_base_url: String,
    platform: Platform,
    client: reqwest::Client,
    hub: ChannelHub,
}

impl BinaryProvisioner {
    pub fn new(config: &Config, hub: ChannelHub) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .user_agent(concat!("node-host/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            install_home: config.install_home.clone(),
            binary_name: config.binary_name.clone(),
            release_base_url: config.release_base_url.clone(),
            platform: Platform::current(),
            client,
            hub,
        })
    }

    /// Override the detected platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_home.join(&self.binary_name)
    }

    fn temp_path(&self) -> PathBuf {
        self.install_home
            .join(format!("{}.{TEMP_SUFFIX}", self.binary_name))
    }

    /// True iff the executable is present at its install path.
    pub fn exists(&self) -> bool {
        self.binary_path().is_file()
    }

    /// Download the artifact for this platform and install it.
    pub async fn download_binary(&self) -> Result<(), ProvisionError> {
        let artifact = self
            .platform
            .artifact_name(&self.binary_name)
            .ok_or_else(|| ProvisionError::UnsupportedPlatform(self.platform.clone()))?;

        tokio::fs::create_dir_all(&self.install_home).await?;

        let url = format!("{}/{artifact}", self.release_base_url);
        info!(%url, platform = %self.platform, "downloading node binary");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%url, %status, "node binary download rejected");
            return Err(ProvisionError::Status { url, status });
        }

        let total = response.content_length();
        if total.is_none() {
            warn!(%url, "server did not advertise a content length; progress is indeterminate");
        }

        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut transferred: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            // On a transport error the partial temp file stays where it is.
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            self.hub.publish(
                CHANNEL_DOWNLOAD_PROGRESS,
                ChannelMessage::Progress(DownloadProgress::new(transferred, total)),
            );
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let final_path = self.binary_path();
        tokio::fs::rename(&temp_path, &final_path).await?;
        make_executable(&final_path).await?;

        info!(path = %final_path.display(), bytes = transferred, "node binary installed");
        Ok(())
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
