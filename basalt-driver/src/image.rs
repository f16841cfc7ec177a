//! Image registry seam used by create-from-image and upload-to-image.

use async_trait::async_trait;
use basalt_core::{Result, StorageError};
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ImageMeta {
    pub id: String,
    pub size_bytes: u64,
    /// Minimum volume size the image declares, in GB. Zero means no floor.
    pub min_disk_gb: u64,
    pub properties: HashMap<String, String>,
}

#[async_trait]
pub trait ImageService: Send + Sync {
    /// Metadata lookup; fails with `ImageNotFound`.
    async fn show(&self, image_id: &str) -> Result<ImageMeta>;

    async fn download(
        &self,
        image_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    async fn upload(
        &self,
        image_id: &str,
        meta: ImageMeta,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;
}

/// In-process registry, the test stand-in for a real image service.
#[derive(Default)]
pub struct MemoryImageService {
    images: RwLock<HashMap<String, (ImageMeta, Vec<u8>)>>,
}

impl MemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_image(&self, meta: ImageMeta, data: Vec<u8>) {
        self.images.write().await.insert(meta.id.clone(), (meta, data));
    }
}

#[async_trait]
impl ImageService for MemoryImageService {
    async fn show(&self, image_id: &str) -> Result<ImageMeta> {
        let images = self.images.read().await;
        images
            .get(image_id)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| StorageError::ImageNotFound {
                image_id: image_id.to_string(),
            })
    }

    async fn download(
        &self,
        image_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let data = {
            let images = self.images.read().await;
            images
                .get(image_id)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| StorageError::ImageNotFound {
                    image_id: image_id.to_string(),
                })?
        };
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn upload(
        &self,
        image_id: &str,
        meta: ImageMeta,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut data = BytesMut::new();
        while reader.read_buf(&mut data).await? > 0 {}
        self.images
            .write()
            .await
            .insert(image_id.to_string(), (meta, data.to_vec()));
        Ok(())
    }
}
