//! Revision reader: list blocks page by page, download them with bounded
//! parallelism, write plaintext in index order, then verify the manifest.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sdrive_core::{
    Block, NodeIdentity, Revision, RevisionId, TransferError, TransferResult, VerificationStatus,
};
use sdrive_crypto::{DecryptedBlock, Manifest, VerifyingKey, DIGEST_SIZE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::DriveApi;
use crate::client::ClientShared;
use crate::downloader::BlockKeys;
use crate::pending::PendingQueue;
use crate::progress::{Progress, ProgressFn};
use crate::semaphore::FifoPermit;

/// Paginated block listing.
///
/// The last block of every page is held back until the next page is known,
/// so the final block can be flagged without a lookahead request. Indices
/// must run 1, 2, 3, ... across pages.
pub(crate) struct BlockLister {
    api: Arc<dyn DriveApi>,
    file: NodeIdentity,
    revision_id: RevisionId,
    page_size: u32,
    ready: VecDeque<Block>,
    outstanding: Option<Block>,
    more_pages: bool,
    next_from: u32,
    next_expected: u32,
    listing_permit: Option<FifoPermit>,
}

impl BlockLister {
    pub(crate) fn new(
        api: Arc<dyn DriveApi>,
        file: NodeIdentity,
        revision_id: RevisionId,
        page_size: u32,
        first_page: Vec<Block>,
        listing_permit: Option<FifoPermit>,
    ) -> Self {
        let mut lister = Self {
            api,
            file,
            revision_id,
            page_size: page_size.max(1),
            ready: VecDeque::new(),
            outstanding: None,
            more_pages: false,
            next_from: 1,
            next_expected: 1,
            listing_permit,
        };
        lister.accept_page(first_page);
        lister
    }

    fn accept_page(&mut self, mut blocks: Vec<Block>) {
        self.more_pages = blocks.len() >= self.page_size as usize;
        blocks.sort_by_key(|b| b.index);
        let Some(last) = blocks.pop() else {
            return;
        };

        if let Some(previous) = self.outstanding.take() {
            self.ready.push_back(previous);
        }
        self.ready.extend(blocks);
        self.next_from = last.index.saturating_add(1);
        self.outstanding = Some(last);
    }

    fn check_index(&mut self, block: &Block) -> TransferResult<()> {
        if block.index != self.next_expected {
            return Err(TransferError::IndexGap {
                expected: self.next_expected,
                found: block.index,
            });
        }
        self.next_expected += 1;
        Ok(())
    }

    /// Next block and whether it is the last one.
    ///
    /// Cancel safe: a page request dropped mid-flight is issued again.
    pub(crate) async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> TransferResult<Option<(Block, bool)>> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            if let Some(block) = self.ready.pop_front() {
                self.check_index(&block)?;
                return Ok(Some((block, false)));
            }

            if self.more_pages {
                trace!(from = self.next_from, "listing next block page");
                let page = self
                    .api
                    .get_revision(&self.file, &self.revision_id, self.next_from, self.page_size)
                    .await?;
                self.accept_page(page.blocks);
                continue;
            }

            // Listing exhausted: free the listing slot for the next file.
            self.listing_permit.take();

            let Some(last) = self.outstanding.take() else {
                return Ok(None);
            };
            self.check_index(&last)?;
            return Ok(Some((last, true)));
        }
    }
}

/// Reads the content of one non-draft revision.
pub struct RevisionReader {
    shared: Arc<ClientShared>,
    file: NodeIdentity,
    revision: Revision,
    keys: Arc<BlockKeys>,
    lister: BlockLister,
    file_gate: Option<FifoPermit>,
}

impl std::fmt::Debug for RevisionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionReader").finish_non_exhaustive()
    }
}

impl RevisionReader {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        file: NodeIdentity,
        revision: Revision,
        keys: BlockKeys,
        lister: BlockLister,
        file_gate: FifoPermit,
    ) -> Self {
        Self {
            shared,
            file,
            revision,
            keys: Arc::new(keys),
            lister,
            file_gate: Some(file_gate),
        }
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// Write the revision's plaintext to `output` and report how far its
    /// manifest signature can be trusted.
    ///
    /// Corrupted content and missing blocks are errors; signature trust is
    /// only ever a [`VerificationStatus`].
    pub async fn read<W>(
        mut self,
        mut output: W,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult<VerificationStatus>
    where
        W: AsyncWrite + Unpin,
    {
        let progress = Progress::new(self.revision.size, progress);
        let tasks_cancel = cancel.child_token();
        let mut pending =
            PendingQueue::with_capacity(self.shared.pools.download_blocks.capacity());
        let mut digests = Vec::new();

        let listed = self
            .dispatch(&mut output, &mut pending, &mut digests, &progress, &tasks_cancel)
            .await;

        // Listing is over: the next file may start filling the pool.
        self.file_gate.take();

        let drained = match listed {
            Ok(()) => self.drain(&mut output, &mut pending, &mut digests, &progress).await,
            Err(e) => Err(e),
        };
        if let Err(err) = drained {
            warn!(
                revision = %self.revision.id,
                in_flight = pending.len(),
                error = %err,
                "download failed, awaiting in-flight blocks"
            );
            tasks_cancel.cancel();
            pending.settle().await;
            return Err(err);
        }
        output.flush().await?;

        let manifest: Manifest = digests
            .iter()
            .copied()
            .chain(self.revision.samples_sha256_digests.iter().copied())
            .collect();
        let status = self.verify_manifest(&manifest).await?;

        info!(
            file = %self.file.node_id,
            revision = %self.revision.id,
            blocks = digests.len(),
            bytes = progress.done(),
            status = ?status,
            "revision downloaded"
        );
        Ok(status)
    }

    async fn dispatch<W>(
        &mut self,
        output: &mut W,
        pending: &mut PendingQueue<u32, DecryptedBlock>,
        digests: &mut Vec<[u8; DIGEST_SIZE]>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> TransferResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut keyrings: HashMap<String, Arc<Vec<VerifyingKey>>> = HashMap::new();

        loop {
            // Blocks at the head of the queue go to the output as soon as
            // they finish, even while the next page is still being listed.
            let listed = tokio::select! {
                biased;
                Some((index, result)) = pending.next(), if !pending.is_empty() => {
                    self.write_block(index, result?, output, digests, progress).await?;
                    continue;
                }
                listed = self.lister.next(cancel) => listed?,
            };
            let Some((block, is_last)) = listed else {
                break;
            };

            let pool = Arc::clone(&self.shared.pools.download_blocks);
            let permit = match pool.try_acquire_owned(1)? {
                Some(permit) => permit,
                None => {
                    if let Some((index, result)) = pending.next().await {
                        self.write_block(index, result?, output, digests, progress).await?;
                    }
                    pool.acquire_owned(1, cancel).await?
                }
            };

            let keyring = self.block_keyring(&block, &mut keyrings).await?;
            trace!(index = block.index, is_last, "dispatching block download");

            let index = block.index;
            let downloader = self.shared.downloader.clone();
            let keys = Arc::clone(&self.keys);
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    result = downloader.download(&block, keys, keyring) => result,
                    _ = task_cancel.cancelled() => Err(TransferError::Cancelled),
                }
            });
            pending.push(index, task);
        }
        Ok(())
    }

    async fn drain<W>(
        &self,
        output: &mut W,
        pending: &mut PendingQueue<u32, DecryptedBlock>,
        digests: &mut Vec<[u8; DIGEST_SIZE]>,
        progress: &Progress,
    ) -> TransferResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some((index, result)) = pending.next().await {
            self.write_block(index, result?, output, digests, progress).await?;
        }
        Ok(())
    }

    async fn write_block<W>(
        &self,
        index: u32,
        block: DecryptedBlock,
        output: &mut W,
        digests: &mut Vec<[u8; DIGEST_SIZE]>,
        progress: &Progress,
    ) -> TransferResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if block.verification != VerificationStatus::Ok {
            warn!(
                index,
                node = %self.file.node_id,
                volume = %self.file.volume_id,
                status = ?block.verification,
                "block signature verification did not succeed"
            );
        }

        digests.push(block.sha256);
        output.write_all(&block.plaintext).await?;
        progress.advance(block.plaintext.len() as u64);
        Ok(())
    }

    /// Keys that verify a block signature: the block signer's address, or
    /// the revision signer's when the block names none.
    ///
    /// Node keys are X25519 and cannot check an Ed25519 signature, so with
    /// neither address the keyring is empty and the block reports
    /// [`VerificationStatus::NoVerifier`].
    async fn block_keyring(
        &self,
        block: &Block,
        cache: &mut HashMap<String, Arc<Vec<VerifyingKey>>>,
    ) -> TransferResult<Arc<Vec<VerifyingKey>>> {
        let email = block
            .signature_email
            .as_deref()
            .or(self.revision.signature_email.as_deref())
            .filter(|email| !email.is_empty());
        let Some(email) = email else {
            return Ok(Arc::new(Vec::new()));
        };

        if let Some(keyring) = cache.get(email) {
            return Ok(Arc::clone(keyring));
        }
        let keyring = Arc::new(self.shared.account.address_public_keys(email).await?);
        cache.insert(email.to_string(), Arc::clone(&keyring));
        Ok(keyring)
    }

    async fn verify_manifest(&self, manifest: &Manifest) -> TransferResult<VerificationStatus> {
        let Some(signature) = &self.revision.manifest_signature else {
            return Ok(VerificationStatus::NotSigned);
        };
        let Some(email) = self
            .revision
            .signature_email
            .as_deref()
            .filter(|email| !email.is_empty())
        else {
            return Ok(VerificationStatus::NoVerifier);
        };

        let keyring = self.shared.account.address_public_keys(email).await?;
        let status = manifest.verify(signature, &keyring);
        debug!(digests = manifest.digest_count(), status = ?status, "manifest verified");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        BlockUploadRequest, BlockUploadResponse, FinalizeRevisionRequest, RevisionPage,
        VerificationInput,
    };
    use async_trait::async_trait;
    use sdrive_core::ApiError;
    use sdrive_crypto::NodeKey;
    use std::sync::Mutex;

    /// Serves a fixed set of block indices, recording requested pages.
    struct Listing {
        indices: Vec<u32>,
        requests: Mutex<Vec<(u32, u32)>>,
    }

    fn block(index: u32) -> Block {
        Block {
            index,
            url: format!("blob://b/{index}"),
            encrypted_signature: None,
            signature_email: None,
        }
    }

    fn file() -> NodeIdentity {
        NodeIdentity {
            volume_id: "v".into(),
            share_id: "s".into(),
            node_id: "n".into(),
        }
    }

    impl Listing {
        fn page(&self, from: u32, size: u32) -> Vec<Block> {
            self.indices
                .iter()
                .copied()
                .filter(|i| *i >= from)
                .take(size as usize)
                .map(block)
                .collect()
        }
    }

    #[async_trait]
    impl DriveApi for Listing {
        async fn create_revision(
            &self,
            _: &NodeIdentity,
            _: Option<&RevisionId>,
            _: &str,
        ) -> Result<RevisionId, ApiError> {
            unimplemented!()
        }

        async fn get_revision(
            &self,
            _: &NodeIdentity,
            id: &RevisionId,
            from_index: u32,
            page_size: u32,
        ) -> Result<RevisionPage, ApiError> {
            self.requests.lock().unwrap().push((from_index, page_size));
            Ok(RevisionPage {
                revision: Revision::draft(id.clone(), "n".into(), "v".into(), 0),
                blocks: self.page(from_index, page_size),
            })
        }

        async fn request_block_upload(
            &self,
            _: BlockUploadRequest,
        ) -> Result<BlockUploadResponse, ApiError> {
            unimplemented!()
        }

        async fn finalize_revision(
            &self,
            _: &NodeIdentity,
            _: &RevisionId,
            _: FinalizeRevisionRequest,
        ) -> Result<(), ApiError> {
            unimplemented!()
        }

        async fn get_verification_input(
            &self,
            _: &NodeIdentity,
            _: &RevisionId,
        ) -> Result<VerificationInput, ApiError> {
            unimplemented!()
        }

        async fn get_node_key(&self, _: &NodeIdentity) -> Result<NodeKey, ApiError> {
            unimplemented!()
        }

        async fn get_content_key_packet(&self, _: &NodeIdentity) -> Result<Vec<u8>, ApiError> {
            unimplemented!()
        }

        async fn delete_revision(&self, _: &NodeIdentity, _: &RevisionId) -> Result<(), ApiError> {
            unimplemented!()
        }
    }

    fn lister(indices: Vec<u32>, page_size: u32) -> (Arc<Listing>, BlockLister) {
        let api = Arc::new(Listing {
            indices,
            requests: Mutex::new(Vec::new()),
        });
        let first = api.page(1, page_size);
        let lister = BlockLister::new(api.clone(), file(), "r".into(), page_size, first, None);
        (api, lister)
    }

    async fn collect(lister: &mut BlockLister) -> TransferResult<Vec<(u32, bool)>> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some((block, last)) = lister.next(&cancel).await? {
            out.push((block.index, last));
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_lists_across_pages_and_flags_last() {
        let (api, mut lister) = lister((1..=7).collect(), 3);

        let listed = collect(&mut lister).await.unwrap();
        let expected: Vec<(u32, bool)> = (1..=7).map(|i| (i, i == 7)).collect();
        assert_eq!(listed, expected);

        // Pages after the first start right after the last index seen.
        assert_eq!(*api.requests.lock().unwrap(), vec![(4, 3), (7, 3)]);
    }

    #[tokio::test]
    async fn test_exact_page_multiple_probes_one_empty_page() {
        let (api, mut lister) = lister((1..=6).collect(), 3);

        let listed = collect(&mut lister).await.unwrap();
        assert_eq!(listed.len(), 6);
        assert_eq!(listed.last(), Some(&(6, true)));
        assert_eq!(*api.requests.lock().unwrap(), vec![(4, 3), (7, 3)]);
    }

    #[tokio::test]
    async fn test_gap_is_fatal() {
        let (_, mut lister) = lister(vec![1, 2, 4, 5], 10);

        let err = collect(&mut lister).await.unwrap_err();
        assert!(matches!(err, TransferError::IndexGap { expected: 3, found: 4 }));
    }

    #[tokio::test]
    async fn test_missing_last_block_across_pages() {
        let (_, mut lister) = lister(vec![1, 2, 3, 5], 3);

        let err = collect(&mut lister).await.unwrap_err();
        assert!(matches!(err, TransferError::IndexGap { expected: 4, found: 5 }));
    }

    #[tokio::test]
    async fn test_empty_listing() {
        let (_, mut lister) = lister(Vec::new(), 10);
        assert!(collect(&mut lister).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_listing() {
        let (_, mut lister) = lister(vec![1, 2], 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(lister.next(&cancel).await.unwrap_err().is_cancelled());
    }
}
