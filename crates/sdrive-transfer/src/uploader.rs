//! Per-block upload: encrypt, verify against the server's content key,
//! register, then PUT the data packet to the issued target.

use std::sync::Arc;

use bytes::Bytes;
use sdrive_core::{
    AddressId, ApiError, FileSample, NodeIdentity, RevisionId, TransferError, TransferResult,
};
use sdrive_crypto::{
    encrypt_block, ContentKey, NodePublicKey, SigningKey, DIGEST_SIZE,
};
use sdrive_storage::BlobStore;
use tracing::debug;

use crate::api::{BlockCreation, BlockUploadRequest, DriveApi, SampleCreation, UploadTarget};
use crate::verifier::BlockVerifier;

/// Everything a block upload needs to know about its revision.
pub struct BlockContext {
    pub file: NodeIdentity,
    pub revision_id: RevisionId,
    pub address_id: AddressId,
    pub content_key: ContentKey,
    pub signing_key: SigningKey,
    pub node_public_key: NodePublicKey,
}

/// Outcome of one uploaded block or sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadedBlock {
    /// SHA-256 of the data packet
    pub sha256: [u8; DIGEST_SIZE],
    pub plain_size: usize,
    pub packet_size: usize,
}

#[derive(Clone)]
pub struct BlockUploader {
    api: Arc<dyn DriveApi>,
    blobs: Arc<dyn BlobStore>,
}

impl BlockUploader {
    pub fn new(api: Arc<dyn DriveApi>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { api, blobs }
    }

    /// Encrypt and upload content block `index` (1-based).
    ///
    /// A packet that fails the prefix check is never registered or uploaded.
    pub async fn upload_block(
        &self,
        context: Arc<BlockContext>,
        verifier: Arc<BlockVerifier>,
        index: u32,
        plaintext: Vec<u8>,
    ) -> TransferResult<UploadedBlock> {
        let encrypted = {
            let context = Arc::clone(&context);
            tokio::task::spawn_blocking(move || {
                encrypt_block(
                    &context.content_key,
                    &context.signing_key,
                    &context.node_public_key,
                    &plaintext,
                )
            })
            .await
            .map_err(|e| TransferError::Other(anyhow::anyhow!("block {index} encryption task: {e}")))?
            .map_err(|e| TransferError::Crypto(format!("block {index}: {e}")))?
        };

        let prefix_end = encrypted.packet.len().min(verifier.packet_prefix_len());
        let token = verifier.verify_block(index, &encrypted.packet[..prefix_end], &encrypted.plain_prefix)?;

        let request = BlockUploadRequest {
            file: context.file.clone(),
            revision_id: context.revision_id.clone(),
            address_id: context.address_id.clone(),
            blocks: vec![BlockCreation {
                index,
                size: encrypted.packet.len(),
                sha256: encrypted.sha256,
                encrypted_signature: encrypted.encrypted_signature,
                verification_token: token.into_bytes(),
            }],
            samples: Vec::new(),
        };
        let target = first_target(self.api.request_block_upload(request).await?.block_targets, "block")?;

        let uploaded = UploadedBlock {
            sha256: encrypted.sha256,
            plain_size: encrypted.plain_len,
            packet_size: encrypted.packet.len(),
        };
        self.put(&target, encrypted.packet).await?;

        debug!(index, bytes = uploaded.packet_size, "block uploaded");
        Ok(uploaded)
    }

    /// Encrypt, sign and upload a sample. Samples skip the verifier step.
    pub async fn upload_sample(
        &self,
        context: Arc<BlockContext>,
        sample: FileSample,
    ) -> TransferResult<UploadedBlock> {
        let kind = sample.kind;
        let encrypted = {
            let context = Arc::clone(&context);
            tokio::task::spawn_blocking(move || {
                encrypt_block(
                    &context.content_key,
                    &context.signing_key,
                    &context.node_public_key,
                    &sample.content,
                )
            })
            .await
            .map_err(|e| TransferError::Other(anyhow::anyhow!("sample {kind:?} encryption task: {e}")))?
            .map_err(|e| TransferError::Crypto(format!("sample {kind:?}: {e}")))?
        };

        let request = BlockUploadRequest {
            file: context.file.clone(),
            revision_id: context.revision_id.clone(),
            address_id: context.address_id.clone(),
            blocks: Vec::new(),
            samples: vec![SampleCreation {
                kind,
                size: encrypted.packet.len(),
                sha256: encrypted.sha256,
                encrypted_signature: encrypted.encrypted_signature,
            }],
        };
        let target = first_target(self.api.request_block_upload(request).await?.sample_targets, "sample")?;

        let uploaded = UploadedBlock {
            sha256: encrypted.sha256,
            plain_size: encrypted.plain_len,
            packet_size: encrypted.packet.len(),
        };
        self.put(&target, encrypted.packet).await?;

        debug!(kind = ?kind, bytes = uploaded.packet_size, "sample uploaded");
        Ok(uploaded)
    }

    async fn put(&self, target: &UploadTarget, packet: Vec<u8>) -> TransferResult<()> {
        self.blobs
            .put(&target.url(), Bytes::from(packet))
            .await
            .map_err(|e| TransferError::Storage(format!("{e:#}")))
    }
}

fn first_target(targets: Vec<UploadTarget>, what: &str) -> TransferResult<UploadTarget> {
    targets.into_iter().next().ok_or_else(|| {
        TransferError::Api(ApiError::Transport(format!("no upload target returned for {what}")))
    })
}
