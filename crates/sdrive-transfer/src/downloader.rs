//! Per-block download: GET the data packet, hash it, decrypt it, and check
//! the block signature.

use std::sync::Arc;

use sdrive_core::{Block, TransferError, TransferResult};
use sdrive_crypto::{decrypt_block, ContentKey, DecryptedBlock, NodeKey, VerifyingKey};
use sdrive_storage::BlobStore;
use tracing::trace;

/// Keys needed to read every block of one revision.
pub struct BlockKeys {
    pub content_key: ContentKey,
    pub node_key: NodeKey,
}

#[derive(Clone)]
pub struct BlockDownloader {
    blobs: Arc<dyn BlobStore>,
}

impl BlockDownloader {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Download and decrypt `block`.
    ///
    /// A packet that does not authenticate is [`TransferError::ContentCorrupted`];
    /// signature problems only show up in [`DecryptedBlock::verification`].
    pub async fn download(
        &self,
        block: &Block,
        keys: Arc<BlockKeys>,
        keyring: Arc<Vec<VerifyingKey>>,
    ) -> TransferResult<DecryptedBlock> {
        let index = block.index;
        let packet = self
            .blobs
            .get(&block.url)
            .await
            .map_err(|e| TransferError::Storage(format!("block {index}: {e:#}")))?;
        trace!(index, bytes = packet.len(), "block fetched");

        let encrypted_signature = block.encrypted_signature.clone();
        tokio::task::spawn_blocking(move || {
            decrypt_block(
                &keys.content_key,
                &packet,
                encrypted_signature.as_deref(),
                &keys.node_key,
                &keyring,
            )
        })
        .await
        .map_err(|e| TransferError::Other(anyhow::anyhow!("block {index} decryption task: {e}")))?
        .map_err(|_| TransferError::ContentCorrupted { index })
    }
}
