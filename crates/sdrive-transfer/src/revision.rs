//! Revision lifecycle: create (with the draft-conflict policy), open for
//! writing or reading, delete.

use std::time::{SystemTime, UNIX_EPOCH};

use sdrive_core::{
    ApiError, NodeIdentity, Revision, RevisionConflict, RevisionId, TransferError, TransferResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::TransferClient;
use crate::downloader::BlockKeys;
use crate::reader::{BlockLister, RevisionReader};
use crate::secrets;
use crate::semaphore::FifoPermit;
use crate::uploader::BlockContext;
use crate::writer::RevisionWriter;

/// Create a draft revision of `file`.
///
/// A conflicting draft left behind by this same client is resumed; any
/// other conflict is returned to the caller.
pub async fn create(
    client: &TransferClient,
    file: &NodeIdentity,
    current_revision_id: Option<&RevisionId>,
) -> TransferResult<Revision> {
    let shared = &client.shared;
    let id = match shared
        .api
        .create_revision(file, current_revision_id, &shared.client_id)
        .await
    {
        Ok(id) => id,
        Err(ApiError::RevisionConflict(conflict)) => {
            match resumable_draft(&conflict, &shared.client_id) {
                Some(draft) => draft,
                None => return Err(ApiError::RevisionConflict(conflict).into()),
            }
        }
        Err(e) => return Err(e.into()),
    };

    debug!(file = %file.node_id, revision = %id, "draft revision ready");
    Ok(Revision::draft(
        id,
        file.node_id.clone(),
        file.volume_id.clone(),
        now(),
    ))
}

fn resumable_draft(conflict: &RevisionConflict, client_id: &str) -> Option<RevisionId> {
    let draft = conflict.draft_revision_id.as_ref()?;
    if conflict.draft_client_id.as_deref() != Some(client_id) {
        return None;
    }
    info!(revision = %draft, "resuming our own draft revision");
    Some(draft.clone())
}

/// Open a draft revision for writing.
///
/// `expected_size` is the plaintext size reported as the progress total.
pub async fn open_for_writing(
    client: &TransferClient,
    file: &NodeIdentity,
    revision: &Revision,
    expected_size: u64,
    cancel: &CancellationToken,
) -> TransferResult<RevisionWriter> {
    open_writer(client, file, revision, expected_size, None, cancel).await
}

pub(crate) async fn open_writer(
    client: &TransferClient,
    file: &NodeIdentity,
    revision: &Revision,
    expected_size: u64,
    reservation: Option<FifoPermit>,
    cancel: &CancellationToken,
) -> TransferResult<RevisionWriter> {
    if !revision.is_draft() {
        return Err(TransferError::InvalidState(format!(
            "cannot write revision {} in state {:?}",
            revision.id, revision.state
        )));
    }

    let shared = &client.shared;
    let node_key = secrets::node_key(shared.secrets.as_ref(), shared.api.as_ref(), file).await?;
    let content_key =
        secrets::content_key(shared.secrets.as_ref(), shared.api.as_ref(), file, &node_key).await?;
    let identity = shared.account.membership_address(&file.share_id).await?;

    let file_gate = shared.pools.upload_file.acquire_owned(1, cancel).await?;
    debug!(revision = %revision.id, signer = %identity.email, "revision opened for writing");

    let context = BlockContext {
        file: file.clone(),
        revision_id: revision.id.clone(),
        address_id: identity.address_id,
        content_key,
        signing_key: identity.signing_key,
        node_public_key: node_key.public_key(),
    };
    Ok(RevisionWriter::new(
        client.shared.clone(),
        file.clone(),
        revision.clone(),
        node_key,
        context,
        identity.email,
        expected_size,
        file_gate,
        reservation,
    ))
}

/// Open a non-draft revision for reading.
pub async fn open_for_reading(
    client: &TransferClient,
    file: &NodeIdentity,
    revision: &Revision,
    cancel: &CancellationToken,
) -> TransferResult<RevisionReader> {
    open_reader(client, file, revision, None, cancel).await
}

pub(crate) async fn open_reader(
    client: &TransferClient,
    file: &NodeIdentity,
    revision: &Revision,
    listing: Option<FifoPermit>,
    cancel: &CancellationToken,
) -> TransferResult<RevisionReader> {
    reject_draft(revision)?;

    let shared = &client.shared;
    let node_key = secrets::node_key(shared.secrets.as_ref(), shared.api.as_ref(), file).await?;
    let content_key =
        secrets::content_key(shared.secrets.as_ref(), shared.api.as_ref(), file, &node_key).await?;

    let page_size = shared.config.block_page_size.max(1);
    let first = shared
        .api
        .get_revision(file, &revision.id, 1, page_size)
        .await?;
    // The server's view wins over what the caller passed in.
    reject_draft(&first.revision)?;

    let file_gate = shared.pools.download_file.acquire_owned(1, cancel).await?;
    debug!(
        revision = %first.revision.id,
        size = first.revision.size,
        "revision opened for reading"
    );

    let lister = BlockLister::new(
        shared.api.clone(),
        file.clone(),
        first.revision.id.clone(),
        page_size,
        first.blocks,
        listing,
    );
    Ok(RevisionReader::new(
        client.shared.clone(),
        file.clone(),
        first.revision,
        BlockKeys {
            content_key,
            node_key,
        },
        lister,
        file_gate,
    ))
}

fn reject_draft(revision: &Revision) -> TransferResult<()> {
    if revision.is_draft() {
        return Err(TransferError::InvalidState(format!(
            "cannot read draft revision {}",
            revision.id
        )));
    }
    Ok(())
}

pub async fn delete(
    client: &TransferClient,
    file: &NodeIdentity,
    revision_id: &RevisionId,
) -> TransferResult<()> {
    client.shared.api.delete_revision(file, revision_id).await?;
    info!(file = %file.node_id, revision = %revision_id, "revision deleted");
    Ok(())
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
