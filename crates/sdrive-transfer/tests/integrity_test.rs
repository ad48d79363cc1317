//! Tampering, trust outcomes and integrity faults.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{config, pattern, Harness};
use sdrive_core::{
    ApiError, NodeIdentity, RevisionId, TransferError, VerificationStatus,
};
use sdrive_crypto::{generate_content_key, seal_content_key, NodeKey};
use sdrive_transfer::api::{
    BlockUploadRequest, BlockUploadResponse, DriveApi, FinalizeRevisionRequest, RevisionPage,
    VerificationInput,
};
use sdrive_transfer::loopback::LoopbackDrive;
use sdrive_transfer::{
    revision, BlockVerifier, CacheKey, Collaborators, InMemorySecretsCache, Secret, SecretKind,
    SecretsCache, TransferClient,
};

const BLOCK: usize = 32;

#[tokio::test]
async fn swapped_blocks_fail_manifest_verification() {
    let h = Harness::new(config(BLOCK, 2));
    let data = pattern(BLOCK * 3);
    let revision = h.upload(&data).await.expect("upload");

    let urls = h.drive.block_urls(&h.file, &revision.id);
    let blobs = h.drive.blobs();
    let first = blobs.get(&urls[0]).await.unwrap();
    let second = blobs.get(&urls[1]).await.unwrap();
    blobs.put(&urls[0], second).await.unwrap();
    blobs.put(&urls[1], first).await.unwrap();

    // Each packet still decrypts; only the order betrays the swap.
    let (content, status) = h.download(&revision).await.expect("download");
    assert_eq!(status, VerificationStatus::Failed);
    assert_eq!(&content[..BLOCK], &data[BLOCK..2 * BLOCK]);
    assert_eq!(&content[BLOCK..2 * BLOCK], &data[..BLOCK]);
    assert!(h.client.pool_usage().is_idle());
}

#[tokio::test]
async fn flipped_ciphertext_byte_is_fatal() {
    let h = Harness::new(config(BLOCK, 2));
    let revision = h.upload(&pattern(BLOCK * 3)).await.expect("upload");

    let urls = h.drive.block_urls(&h.file, &revision.id);
    let mut packet = h.drive.blobs().get(&urls[1]).await.unwrap().to_vec();
    packet[30] ^= 0x01;
    h.drive.blobs().put(&urls[1], Bytes::from(packet)).await.unwrap();

    let err = h.download(&revision).await.unwrap_err();
    assert!(
        matches!(err, TransferError::ContentCorrupted { index: 2 }),
        "unexpected error: {err}"
    );
    assert!(h.client.pool_usage().is_idle());
}

#[tokio::test]
async fn unsigned_manifest_is_reported() {
    let h = Harness::new(config(BLOCK, 2));
    let data = pattern(50);
    let revision = h.upload(&data).await.expect("upload");
    h.drive.strip_manifest_signature(&h.file, &revision.id);

    let (content, status) = h.download(&revision).await.expect("download");
    assert_eq!(content, data);
    assert_eq!(status, VerificationStatus::NotSigned);
}

#[tokio::test]
async fn signer_without_keys_has_no_verifier() {
    let h = Harness::new(config(BLOCK, 2));
    let data = pattern(70);
    let revision = h.upload(&data).await.expect("upload");
    h.drive.remove_address_keys(&h.drive.owner().email);

    let (content, status) = h.download(&revision).await.expect("download");
    assert_eq!(content, data);
    assert_eq!(status, VerificationStatus::NoVerifier);
}

#[tokio::test]
async fn missing_block_in_listing_is_an_index_gap() {
    let h = Harness::new(config(BLOCK, 2));
    let revision = h.upload(&pattern(BLOCK * 5)).await.expect("upload");
    assert!(h.drive.remove_block(&h.file, &revision.id, 3));

    let err = h.download(&revision).await.unwrap_err();
    assert!(
        matches!(err, TransferError::IndexGap { expected: 3, found: 4 }),
        "unexpected error: {err}"
    );
    assert!(h.client.pool_usage().is_idle());
}

fn foreign_content_key_packet() -> Vec<u8> {
    seal_content_key(&NodeKey::generate().public_key(), &generate_content_key()).unwrap()
}

#[tokio::test]
async fn verifier_rejects_content_key_for_another_node() {
    let h = Harness::new(config(BLOCK, 2));
    let draft = h
        .drive
        .create_revision(&h.file, None, "someone")
        .await
        .unwrap();
    h.drive
        .replace_content_key_packet(&h.file, foreign_content_key_packet());

    let node_key = h.drive.node_key(&h.file).unwrap();
    let err = BlockVerifier::create(&*h.drive, &h.file, &draft, &node_key)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::KeyMismatch));
}

#[tokio::test]
async fn upload_with_mismatched_key_packet_fails() {
    let h = Harness::new(config(BLOCK, 2));
    h.drive
        .replace_content_key_packet(&h.file, foreign_content_key_packet());

    let err = h.upload(&pattern(10)).await.unwrap_err();
    assert!(matches!(err, TransferError::KeyMismatch));
    assert!(h.client.pool_usage().is_idle());
}

#[tokio::test]
async fn blocks_under_a_stale_content_key_are_never_uploaded() {
    let drive = LoopbackDrive::in_memory().unwrap();
    let file = drive.create_file("share").unwrap();

    // A cached content key that is not the one the server holds.
    let secrets = Arc::new(InMemorySecretsCache::new());
    secrets.set(
        CacheKey::new(&file, SecretKind::ContentKey),
        Secret::ContentKey(generate_content_key()),
    );
    let client = TransferClient::new(
        config(BLOCK, 2),
        Collaborators {
            secrets,
            ..drive.collaborators()
        },
    );

    let h = Harness {
        drive: Arc::clone(&drive),
        client,
        file: file.clone(),
    };
    let err = h.upload(&pattern(BLOCK * 2)).await.unwrap_err();
    assert!(
        matches!(err, TransferError::DataPacketMismatch { .. }),
        "unexpected error: {err}"
    );

    // The draft stays behind, empty.
    let draft = match drive.create_revision(&file, None, "probe").await {
        Err(ApiError::RevisionConflict(conflict)) => conflict.draft_revision_id.unwrap(),
        other => panic!("expected a leftover draft, got {other:?}"),
    };
    assert!(drive.block_urls(&file, &draft).is_empty());
}

/// Metadata service that corrupts every verification token in transit.
struct CorruptTokens(Arc<LoopbackDrive>);

#[async_trait]
impl DriveApi for CorruptTokens {
    async fn create_revision(
        &self,
        file: &NodeIdentity,
        current: Option<&RevisionId>,
        client_id: &str,
    ) -> Result<RevisionId, ApiError> {
        self.0.create_revision(file, current, client_id).await
    }

    async fn get_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        from_index: u32,
        page_size: u32,
    ) -> Result<RevisionPage, ApiError> {
        self.0.get_revision(file, revision_id, from_index, page_size).await
    }

    async fn request_block_upload(
        &self,
        mut request: BlockUploadRequest,
    ) -> Result<BlockUploadResponse, ApiError> {
        for block in &mut request.blocks {
            block.verification_token[0] ^= 0xff;
        }
        self.0.request_block_upload(request).await
    }

    async fn finalize_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        request: FinalizeRevisionRequest,
    ) -> Result<(), ApiError> {
        self.0.finalize_revision(file, revision_id, request).await
    }

    async fn get_verification_input(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<VerificationInput, ApiError> {
        self.0.get_verification_input(file, revision_id).await
    }

    async fn get_node_key(&self, file: &NodeIdentity) -> Result<NodeKey, ApiError> {
        self.0.get_node_key(file).await
    }

    async fn get_content_key_packet(&self, file: &NodeIdentity) -> Result<Vec<u8>, ApiError> {
        self.0.get_content_key_packet(file).await
    }

    async fn delete_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<(), ApiError> {
        self.0.delete_revision(file, revision_id).await
    }
}

#[tokio::test]
async fn server_rejects_bad_verification_tokens() {
    let drive = LoopbackDrive::in_memory().unwrap();
    let file = drive.create_file("share").unwrap();
    let client = TransferClient::new(
        config(BLOCK, 2),
        Collaborators {
            api: Arc::new(CorruptTokens(Arc::clone(&drive))),
            ..drive.collaborators()
        },
    );
    let h = Harness {
        drive: Arc::clone(&drive),
        client,
        file,
    };

    let err = h.upload(&pattern(BLOCK * 2)).await.unwrap_err();
    assert!(
        matches!(err, TransferError::Api(ApiError::Rejected { .. })),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn reading_through_revision_module_matches_client() {
    let h = Harness::new(config(BLOCK, 2));
    let data = pattern(90);
    let revision = h.upload(&data).await.expect("upload");

    let cancel = tokio_util::sync::CancellationToken::new();
    let reader = revision::open_for_reading(&h.client, &h.file, &revision, &cancel)
        .await
        .expect("open");
    assert_eq!(reader.revision().id, revision.id);

    let mut out = Vec::new();
    let status = reader.read(&mut out, None, &cancel).await.expect("read");
    assert_eq!(out, data);
    assert_eq!(status, VerificationStatus::Ok);
}
