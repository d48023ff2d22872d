use std::sync::Arc;

use cloudhop_contract::{ImageHandle, ImageRef};
use cloudhop_services::{ImageCreate, ImageService};
use tracing::info;

use crate::error::WorkflowError;
use crate::proxy::CopyProxy;

/// Makes source images available in the destination catalog with identical
/// content.
#[derive(Clone)]
pub struct ImageReconciler {
    source: Arc<dyn ImageService>,
    destination: Arc<dyn ImageService>,
    proxy: CopyProxy,
}

impl ImageReconciler {
    pub fn new(
        source: Arc<dyn ImageService>,
        destination: Arc<dyn ImageService>,
        proxy: CopyProxy,
    ) -> Self {
        Self {
            source,
            destination,
            proxy,
        }
    }

    /// Returns the destination image carrying `checksum`, copying the source
    /// image over first when none does.
    pub async fn ensure_image(
        &self,
        checksum: &str,
        image: &ImageRef,
    ) -> Result<ImageHandle, WorkflowError> {
        let existing = self
            .destination
            .list_images()
            .await?
            .into_iter()
            .find(|candidate| candidate.checksum.as_deref() == Some(checksum));
        if let Some(found) = existing {
            info!(image_id = %found.id, checksum = %checksum, "image already present on destination");
            return Ok(found);
        }
        let name = format!("{}Migrate", image.name);
        self.copy_image(checksum, &image.id, &name).await
    }

    /// Streams a source image into a new destination image named `name` and
    /// verifies its checksum.
    pub async fn copy_image(
        &self,
        checksum: &str,
        source_image_id: &str,
        name: &str,
    ) -> Result<ImageHandle, WorkflowError> {
        let source = self.source.get_image(source_image_id).await?;
        let download = self.source.download_image(source_image_id).await?;
        let data = self
            .proxy
            .wrap(download, source.size, &source.id, &source.name);

        let created = self
            .destination
            .create_image(
                &ImageCreate {
                    name: name.to_string(),
                    container_format: source.container_format.clone(),
                    disk_format: source.disk_format.clone(),
                    is_public: source.is_public,
                    protected: source.protected,
                    size: source.size,
                },
                data,
            )
            .await?;

        let actual = created.checksum.clone().unwrap_or_default();
        if actual != checksum {
            return Err(WorkflowError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual,
            });
        }
        info!(source_image = %source.id, image_id = %created.id, "image copied to destination");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudhop_contract::ImageRef;
    use cloudhop_services::{content_checksum, InMemoryCloud};

    use super::ImageReconciler;
    use crate::error::WorkflowError;
    use crate::proxy::CopyProxy;

    fn reconciler(source: &Arc<InMemoryCloud>, dest: &Arc<InMemoryCloud>) -> ImageReconciler {
        ImageReconciler::new(source.clone(), dest.clone(), CopyProxy::default())
    }

    fn reference(id: &str, content: &[u8]) -> ImageRef {
        ImageRef {
            id: id.to_string(),
            checksum: content_checksum(content),
            name: "ubuntu".to_string(),
        }
    }

    #[tokio::test]
    async fn existing_checksum_short_circuits() {
        let source = Arc::new(InMemoryCloud::new());
        let dest = Arc::new(InMemoryCloud::new());
        source.add_image("src-img", "ubuntu", b"base-image");
        let present = dest.add_image("dst-img", "ubuntu", b"base-image");
        let image = reference("src-img", b"base-image");

        let found = reconciler(&source, &dest)
            .ensure_image(&image.checksum, &image)
            .await
            .expect("ensure");

        assert_eq!(found, present);
        assert!(source.calls_starting_with("download_image").is_empty());
        assert!(dest.calls_starting_with("create_image").is_empty());
    }

    #[tokio::test]
    async fn missing_image_is_copied_once() {
        let source = Arc::new(InMemoryCloud::new());
        let dest = Arc::new(InMemoryCloud::new());
        source.add_image("src-img", "ubuntu", b"base-image");
        let image = reference("src-img", b"base-image");

        let created = reconciler(&source, &dest)
            .ensure_image(&image.checksum, &image)
            .await
            .expect("ensure");

        assert_eq!(created.name, "ubuntuMigrate");
        assert_eq!(dest.calls_starting_with("create_image").len(), 1);
        assert_eq!(dest.images().len(), 1);
    }

    #[tokio::test]
    async fn corrupted_copy_is_fatal() {
        let source = Arc::new(InMemoryCloud::new());
        let dest = Arc::new(InMemoryCloud::new());
        dest.corrupt_uploads(true);
        source.add_image("src-img", "ubuntu", b"base-image");
        let image = reference("src-img", b"base-image");

        let err = reconciler(&source, &dest)
            .ensure_image(&image.checksum, &image)
            .await
            .expect_err("mismatch");

        assert!(matches!(err, WorkflowError::ChecksumMismatch { ref expected, .. } if *expected == image.checksum));
        assert_eq!(dest.calls_starting_with("create_image").len(), 1);
    }
}
