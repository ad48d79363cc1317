//! Revision writer: chunk an input stream into blocks, upload them with
//! bounded parallelism, then sign the manifest and finalize the draft.

use std::sync::Arc;

use sdrive_core::{
    CommonAttributes, ExtendedAttributes, FileSample, NodeIdentity, Revision, RevisionState,
    SampleKind, TransferError, TransferResult,
};
use sdrive_crypto::{seal, Manifest, NodeKey, DIGEST_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::FinalizeRevisionRequest;
use crate::client::ClientShared;
use crate::pending::PendingQueue;
use crate::progress::{Progress, ProgressFn};
use crate::semaphore::FifoPermit;
use crate::uploader::{BlockContext, UploadedBlock};
use crate::verifier::BlockVerifier;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Block(u32),
    Sample(SampleKind),
}

/// Block digests in index order, sample digests as uploaded.
#[derive(Default)]
struct ManifestParts {
    blocks: Vec<[u8; DIGEST_SIZE]>,
    samples: Vec<(SampleKind, [u8; DIGEST_SIZE])>,
    quota: u64,
}

impl ManifestParts {
    fn push(&mut self, entry: Entry, uploaded: UploadedBlock) {
        self.quota += uploaded.packet_size as u64;
        match entry {
            Entry::Block(index) => {
                debug_assert_eq!(index as usize, self.blocks.len() + 1);
                self.blocks.push(uploaded.sha256);
            }
            Entry::Sample(kind) => self.samples.push((kind, uploaded.sha256)),
        }
    }

    fn sample_digests(&self) -> Vec<[u8; DIGEST_SIZE]> {
        let mut samples = self.samples.clone();
        samples.sort_by_key(|(kind, _)| *kind);
        samples.into_iter().map(|(_, digest)| digest).collect()
    }

    fn manifest(&self) -> Manifest {
        self.blocks
            .iter()
            .copied()
            .chain(self.sample_digests())
            .collect()
    }
}

struct WriteState {
    pending: PendingQueue<Entry, UploadedBlock>,
    parts: ManifestParts,
    block_sizes: Vec<u64>,
    size: u64,
}

/// Writes the content of one draft revision.
///
/// Holds the upload file gate from opening until chunking ends, and the
/// file's share of the block-creation pool until it is dropped.
pub struct RevisionWriter {
    shared: Arc<ClientShared>,
    file: NodeIdentity,
    revision: Revision,
    node_key: NodeKey,
    context: Arc<BlockContext>,
    signature_email: String,
    expected_size: u64,
    file_gate: Option<FifoPermit>,
    reservation: Option<Arc<FifoPermit>>,
}

impl std::fmt::Debug for RevisionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionWriter").finish_non_exhaustive()
    }
}

impl RevisionWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        file: NodeIdentity,
        revision: Revision,
        node_key: NodeKey,
        context: BlockContext,
        signature_email: String,
        expected_size: u64,
        file_gate: FifoPermit,
        reservation: Option<FifoPermit>,
    ) -> Self {
        Self {
            shared,
            file,
            revision,
            node_key,
            context: Arc::new(context),
            signature_email,
            expected_size,
            file_gate: Some(file_gate),
            reservation: reservation.map(Arc::new),
        }
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// Upload `input` as the revision's content, then finalize it.
    ///
    /// Samples are uploaded first. On any failure, in-flight uploads are
    /// cancelled and awaited before the first error is returned; the draft
    /// is left for the server to collect.
    pub async fn write<R>(
        mut self,
        mut input: R,
        samples: Vec<FileSample>,
        modification_time: Option<u64>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult<Revision>
    where
        R: AsyncRead + Unpin,
    {
        let verifier = Arc::new(
            BlockVerifier::create(
                self.shared.api.as_ref(),
                &self.file,
                &self.revision.id,
                &self.node_key,
            )
            .await?,
        );
        let progress = Progress::new(self.expected_size, progress);
        let tasks_cancel = cancel.child_token();

        let mut state = WriteState {
            pending: PendingQueue::with_capacity(self.shared.pools.upload_blocks.capacity()),
            parts: ManifestParts::default(),
            block_sizes: Vec::new(),
            size: 0,
        };

        let dispatched = self
            .dispatch(&mut input, samples, &verifier, &progress, &mut state, &tasks_cancel)
            .await;

        // Chunking is over: the next file may start filling the pool.
        self.file_gate.take();

        let drained = match dispatched {
            Ok(()) => drain(&mut state).await,
            Err(e) => Err(e),
        };
        if let Err(err) = drained {
            warn!(
                revision = %self.revision.id,
                in_flight = state.pending.len(),
                error = %err,
                "upload failed, awaiting in-flight blocks"
            );
            tasks_cancel.cancel();
            state.pending.settle().await;
            return Err(err);
        }

        self.finalize(state, modification_time).await
    }

    async fn dispatch<R>(
        &self,
        input: &mut R,
        mut samples: Vec<FileSample>,
        verifier: &Arc<BlockVerifier>,
        progress: &Arc<Progress>,
        state: &mut WriteState,
        cancel: &CancellationToken,
    ) -> TransferResult<()>
    where
        R: AsyncRead + Unpin,
    {
        samples.sort_by_key(|s| s.kind);
        for sample in samples {
            let permit = self.wait_for_block_slot(state, cancel).await?;
            let kind = sample.kind;
            let task = self.spawn_sample(sample, permit, cancel.clone());
            state.pending.push(Entry::Sample(kind), task);
        }

        let block_size = self.shared.config.block_size.max(1);
        let mut index = 0u32;
        loop {
            let chunk = tokio::select! {
                chunk = read_chunk(input, block_size) => chunk?,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            // An empty input still produces one (empty) block.
            if chunk.is_empty() && index > 0 {
                break;
            }
            let at_eof = chunk.len() < block_size;

            index += 1;
            state.block_sizes.push(chunk.len() as u64);
            state.size += chunk.len() as u64;

            let permit = self.wait_for_block_slot(state, cancel).await?;
            debug!(index, bytes = chunk.len(), "dispatching block upload");
            let task = self.spawn_block(
                index,
                chunk,
                Arc::clone(verifier),
                Arc::clone(progress),
                permit,
                cancel.clone(),
            );
            state.pending.push(Entry::Block(index), task);

            if at_eof {
                break;
            }
        }
        Ok(())
    }

    /// Take a block-transfer slot. When none is free, fold the oldest
    /// in-flight upload into the manifest before waiting in line.
    async fn wait_for_block_slot(
        &self,
        state: &mut WriteState,
        cancel: &CancellationToken,
    ) -> TransferResult<FifoPermit> {
        let pool = &self.shared.pools.upload_blocks;
        if let Some(permit) = pool.try_acquire_owned(1)? {
            return Ok(permit);
        }
        if let Some((entry, result)) = state.pending.next().await {
            state.parts.push(entry, result?);
        }
        pool.acquire_owned(1, cancel).await
    }

    fn spawn_block(
        &self,
        index: u32,
        plaintext: Vec<u8>,
        verifier: Arc<BlockVerifier>,
        progress: Arc<Progress>,
        permit: FifoPermit,
        cancel: CancellationToken,
    ) -> JoinHandle<TransferResult<UploadedBlock>> {
        let uploader = self.shared.uploader.clone();
        let context = Arc::clone(&self.context);
        let reservation = self.reservation.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                result = uploader.upload_block(context, verifier, index, plaintext) => result,
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
            };
            if let Some(reservation) = &reservation {
                reservation.release(1);
            }
            let uploaded = result?;
            progress.advance(uploaded.plain_size as u64);
            Ok(uploaded)
        })
    }

    fn spawn_sample(
        &self,
        sample: FileSample,
        permit: FifoPermit,
        cancel: CancellationToken,
    ) -> JoinHandle<TransferResult<UploadedBlock>> {
        let uploader = self.shared.uploader.clone();
        let context = Arc::clone(&self.context);
        let reservation = self.reservation.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                result = uploader.upload_sample(context, sample) => result,
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
            };
            if let Some(reservation) = &reservation {
                reservation.release(1);
            }
            result
        })
    }

    async fn finalize(
        self,
        state: WriteState,
        modification_time: Option<u64>,
    ) -> TransferResult<Revision> {
        let manifest = state.parts.manifest();
        let manifest_signature = manifest.sign(&self.context.signing_key);

        let attributes = ExtendedAttributes {
            common: CommonAttributes {
                size: state.size,
                modification_time,
                block_sizes: state.block_sizes.clone(),
            },
        };
        let attributes_json = serde_json::to_vec(&attributes)
            .map_err(|e| TransferError::Other(anyhow::anyhow!("serializing extended attributes: {e}")))?;
        let extended_attributes = seal(&self.context.node_public_key, &attributes_json)
            .map_err(|e| TransferError::Crypto(format!("sealing extended attributes: {e}")))?;

        self.shared
            .api
            .finalize_revision(
                &self.file,
                &self.revision.id,
                FinalizeRevisionRequest {
                    manifest_signature: manifest_signature.clone(),
                    signature_email: self.signature_email.clone(),
                    extended_attributes,
                    size: state.size,
                },
            )
            .await?;

        info!(
            file = %self.file.node_id,
            revision = %self.revision.id,
            blocks = state.block_sizes.len(),
            samples = state.parts.samples.len(),
            bytes = state.size,
            "revision finalized"
        );

        Ok(Revision {
            state: RevisionState::Active,
            size: state.size,
            quota_consumption: state.parts.quota,
            manifest_signature: Some(manifest_signature),
            signature_email: Some(self.signature_email.clone()),
            samples_sha256_digests: state.parts.sample_digests(),
            ..self.revision.clone()
        })
    }
}

async fn drain(state: &mut WriteState) -> TransferResult<()> {
    while let Some((entry, result)) = state.pending.next().await {
        state.parts.push(entry, result?);
    }
    Ok(())
}

/// Read up to `block_size` bytes. Shorter only at end of input.
async fn read_chunk<R>(input: &mut R, block_size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = Vec::with_capacity(block_size);
    input.take(block_size as u64).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrive_crypto::sha256;

    #[tokio::test]
    async fn test_read_chunk_splits_at_block_size() {
        let data = vec![7u8; 10];
        let mut input = &data[..];

        assert_eq!(read_chunk(&mut input, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut input, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut input, 4).await.unwrap().len(), 2);
        assert!(read_chunk(&mut input, 4).await.unwrap().is_empty());
    }

    #[test]
    fn test_manifest_puts_blocks_before_sorted_samples() {
        let uploaded = |tag: u8| UploadedBlock {
            sha256: sha256(&[tag]),
            plain_size: 1,
            packet_size: 41,
        };

        let mut parts = ManifestParts::default();
        parts.push(Entry::Sample(SampleKind::Preview), uploaded(9));
        parts.push(Entry::Sample(SampleKind::Thumbnail), uploaded(8));
        parts.push(Entry::Block(1), uploaded(1));
        parts.push(Entry::Block(2), uploaded(2));

        let expected: Manifest = [1u8, 2, 8, 9].iter().map(|t| sha256(&[*t])).collect();
        assert_eq!(parts.manifest(), expected);
        assert_eq!(parts.quota, 4 * 41);
    }
}
