//! Artifact provider trait.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::artifacts::item::ArtifactItem;
use crate::error::ArtifactError;

/// A readable stream of artifact bytes.
pub type ArtifactStream = Box<dyn AsyncRead + Send + Unpin>;

/// Backend that can list, read and write an artifact tree.
///
/// The filesystem provider is one implementation; object stores and remote
/// build-artifact services implement the same contract. Implementations must
/// honour [`DOWNLOAD_URL_KEY`](crate::artifacts::DOWNLOAD_URL_KEY) on items
/// they produce and set
/// [`DESTINATION_URL_KEY`](crate::artifacts::DESTINATION_URL_KEY) on items
/// they write.
#[async_trait]
pub trait ArtifactProvider: Send + Sync {
    /// Short backend name for logs (e.g. "filesystem").
    fn name(&self) -> &str;

    /// The synthetic root folder of this provider's tree.
    async fn get_root_items(&self) -> Result<Vec<ArtifactItem>, ArtifactError>;

    /// Direct children of a folder item.
    async fn get_artifact_items(
        &self,
        item: &ArtifactItem,
    ) -> Result<Vec<ArtifactItem>, ArtifactError>;

    /// Open an item's bytes for reading.
    async fn get_artifact_item(&self, item: &ArtifactItem) -> Result<ArtifactStream, ArtifactError>;

    /// Persist `stream` at the item's relative path.
    ///
    /// Resolves once the whole stream has been consumed and flushed, and
    /// returns the item with its destination address recorded.
    async fn put_artifact_item(
        &self,
        item: ArtifactItem,
        stream: ArtifactStream,
        cancel: &CancellationToken,
    ) -> Result<ArtifactItem, ArtifactError>;
}
