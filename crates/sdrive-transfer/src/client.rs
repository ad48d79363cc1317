//! Transfer client: owns the collaborators and the concurrency pools shared
//! by every upload and download it starts.

use std::sync::Arc;

use sdrive_core::config::TransferConfig;
use sdrive_core::{
    FileSample, NodeIdentity, Revision, RevisionId, TransferResult, VerificationStatus,
};
use sdrive_storage::BlobStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{AccountApi, DriveApi};
use crate::downloader::BlockDownloader;
use crate::progress::ProgressFn;
use crate::revision;
use crate::secrets::SecretsCache;
use crate::semaphore::{FifoPermit, FifoResource};
use crate::uploader::BlockUploader;

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn DriveApi>,
    pub account: Arc<dyn AccountApi>,
    pub blobs: Arc<dyn BlobStore>,
    pub secrets: Arc<dyn SecretsCache>,
}

pub(crate) struct Pools {
    pub(crate) upload_blocks: Arc<FifoResource>,
    pub(crate) download_blocks: Arc<FifoResource>,
    pub(crate) upload_file: Arc<FifoResource>,
    pub(crate) download_file: Arc<FifoResource>,
    pub(crate) revision_creation: Arc<FifoResource>,
    pub(crate) block_listing: Arc<FifoResource>,
}

impl Pools {
    fn new(config: &TransferConfig) -> Self {
        let transfers = config.effective_block_transfers();
        let processing = config.effective_block_processing();
        Self {
            upload_blocks: Arc::new(FifoResource::new(transfers)),
            download_blocks: Arc::new(FifoResource::new(transfers)),
            upload_file: Arc::new(FifoResource::new(1)),
            download_file: Arc::new(FifoResource::new(1)),
            revision_creation: Arc::new(FifoResource::new(processing)),
            block_listing: Arc::new(FifoResource::new(processing)),
        }
    }
}

pub(crate) struct ClientShared {
    pub(crate) api: Arc<dyn DriveApi>,
    pub(crate) account: Arc<dyn AccountApi>,
    pub(crate) secrets: Arc<dyn SecretsCache>,
    pub(crate) config: TransferConfig,
    pub(crate) client_id: String,
    pub(crate) pools: Pools,
    pub(crate) uploader: BlockUploader,
    pub(crate) downloader: BlockDownloader,
}

/// Snapshot of every pool's current usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolUsage {
    pub upload_blocks: usize,
    pub download_blocks: usize,
    pub upload_file: usize,
    pub download_file: usize,
    pub revision_creation: usize,
    pub block_listing: usize,
}

impl PoolUsage {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Entry point of the engine. Cheap to clone; clones share pools.
#[derive(Clone)]
pub struct TransferClient {
    pub(crate) shared: Arc<ClientShared>,
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("client_id", &self.shared.client_id)
            .field("usage", &self.pool_usage())
            .finish_non_exhaustive()
    }
}

impl TransferClient {
    pub fn new(config: TransferConfig, collaborators: Collaborators) -> Self {
        let pools = Pools::new(&config);
        let client_id = config.effective_client_id();
        debug!(
            client_id = %client_id,
            block_size = config.block_size,
            block_transfers = pools.upload_blocks.capacity(),
            block_processing = pools.revision_creation.capacity(),
            "transfer client created"
        );

        let Collaborators {
            api,
            account,
            blobs,
            secrets,
        } = collaborators;
        Self {
            shared: Arc::new(ClientShared {
                uploader: BlockUploader::new(Arc::clone(&api), Arc::clone(&blobs)),
                downloader: BlockDownloader::new(blobs),
                api,
                account,
                secrets,
                config,
                client_id,
                pools,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn config(&self) -> &TransferConfig {
        &self.shared.config
    }

    pub fn pool_usage(&self) -> PoolUsage {
        let pools = &self.shared.pools;
        PoolUsage {
            upload_blocks: pools.upload_blocks.usage(),
            download_blocks: pools.download_blocks.usage(),
            upload_file: pools.upload_file.usage(),
            download_file: pools.download_file.usage(),
            revision_creation: pools.revision_creation.usage(),
            block_listing: pools.block_listing.usage(),
        }
    }

    /// Reserve block-creation capacity for a file of `size` bytes with
    /// `sample_count` samples, waiting in line behind earlier files.
    pub async fn wait_for_file_uploader(
        &self,
        size: u64,
        sample_count: usize,
        cancel: &CancellationToken,
    ) -> TransferResult<FileUploader> {
        let pool = &self.shared.pools.revision_creation;
        let amount = self.expected_block_count(size, sample_count).min(pool.capacity());
        let reservation = pool.acquire_owned(amount, cancel).await?;
        debug!(size, amount, "file uploader ready");

        Ok(FileUploader {
            client: self.clone(),
            size,
            reservation,
        })
    }

    /// Reserve a block-listing slot for one file download.
    pub async fn wait_for_file_downloader(
        &self,
        cancel: &CancellationToken,
    ) -> TransferResult<FileDownloader> {
        let listing = self.shared.pools.block_listing.acquire_owned(1, cancel).await?;
        Ok(FileDownloader {
            client: self.clone(),
            listing,
        })
    }

    pub async fn get_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> TransferResult<Revision> {
        let page = self.shared.api.get_revision(file, revision_id, 1, 1).await?;
        Ok(page.revision)
    }

    pub async fn delete_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> TransferResult<()> {
        revision::delete(self, file, revision_id).await
    }

    /// Blocks a file of `size` bytes is chunked into, plus its samples.
    fn expected_block_count(&self, size: u64, sample_count: usize) -> usize {
        let block_size = self.shared.config.block_size.max(1) as u64;
        let blocks = size.div_ceil(block_size).max(1);
        usize::try_from(blocks)
            .unwrap_or(usize::MAX)
            .saturating_add(sample_count)
    }
}

/// Where an upload goes: the file, and the revision it replaces if any.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: NodeIdentity,
    pub current_revision_id: Option<RevisionId>,
}

/// A single file upload holding its block-creation reservation.
#[derive(Debug)]
pub struct FileUploader {
    client: TransferClient,
    size: u64,
    reservation: FifoPermit,
}

impl FileUploader {
    pub fn reserved(&self) -> usize {
        self.reservation.remaining()
    }

    /// Create (or resume) a draft and upload `input` into it.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload<R>(
        self,
        request: &UploadRequest,
        input: R,
        samples: Vec<FileSample>,
        modification_time: Option<u64>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult<Revision>
    where
        R: AsyncRead + Unpin,
    {
        let draft = revision::create(
            &self.client,
            &request.file,
            request.current_revision_id.as_ref(),
        )
        .await?;
        let writer = revision::open_writer(
            &self.client,
            &request.file,
            &draft,
            self.size,
            Some(self.reservation),
            cancel,
        )
        .await?;
        writer
            .write(input, samples, modification_time, progress, cancel)
            .await
    }
}

/// A single file download holding its block-listing slot.
#[derive(Debug)]
pub struct FileDownloader {
    client: TransferClient,
    listing: FifoPermit,
}

impl FileDownloader {
    /// Write the plaintext of `revision` to `output`.
    pub async fn download<W>(
        self,
        file: &NodeIdentity,
        revision: &Revision,
        output: W,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult<VerificationStatus>
    where
        W: AsyncWrite + Unpin,
    {
        let reader =
            revision::open_reader(&self.client, file, revision, Some(self.listing), cancel).await?;
        reader.read(output, progress, cancel).await
    }
}
