//! Backup target abstraction: the manager streams volume bytes in and
//! out, the service owns object layout and compression.

use async_trait::async_trait;
use basalt_core::{Backup, Result, StorageError};
use bytes::BytesMut;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const DEFAULT_CONTAINER: &str = "volumebackups";

#[async_trait]
pub trait BackupService: Send + Sync {
    /// Consume the volume stream and persist it under the backup's
    /// container.
    async fn backup(
        &self,
        backup: &Backup,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    /// Stream the stored object back into the destination volume.
    async fn restore(
        &self,
        backup: &Backup,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    async fn delete(&self, backup: &Backup) -> Result<()>;
}

/// Filesystem-backed service storing one gzip object per backup.
pub struct LocalBackupService {
    root: PathBuf,
}

impl LocalBackupService {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, backup: &Backup) -> PathBuf {
        let container = backup.container.as_deref().unwrap_or(DEFAULT_CONTAINER);
        self.root.join(container).join(format!("backup-{}.gz", backup.id))
    }
}

#[async_trait]
impl BackupService for LocalBackupService {
    async fn backup(
        &self,
        backup: &Backup,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut payload = BytesMut::new();
        while reader.read_buf(&mut payload).await? > 0 {}

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;

        let path = self.object_path(backup);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &compressed).await?;
        info!(
            backup_id = %backup.id,
            raw_bytes = payload.len(),
            stored_bytes = compressed.len(),
            "backup object written"
        );
        Ok(())
    }

    async fn restore(
        &self,
        backup: &Backup,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let path = self.object_path(backup);
        if !path.exists() {
            return Err(StorageError::InvalidBackup {
                reason: format!("backup object for {} missing", backup.id),
            });
        }
        let compressed = fs::read(&path).await?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut payload = Vec::new();
        decoder.read_to_end(&mut payload)?;

        writer.write_all(&payload).await?;
        writer.flush().await?;
        debug!(backup_id = %backup.id, bytes = payload.len(), "backup object restored");
        Ok(())
    }

    async fn delete(&self, backup: &Backup) -> Result<()> {
        let path = self.object_path(backup);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
