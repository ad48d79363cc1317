//! Contracts of the metadata/API and account collaborators
//!
//! Only the semantic content of each call is modelled here; transport,
//! retries and wire encoding belong to the implementations.

use async_trait::async_trait;
use sdrive_core::{
    AddressId, ApiError, Block, NodeIdentity, Revision, RevisionId, SampleKind, ShareId,
};
use sdrive_crypto::{NodeKey, SigningKey, VerifyingKey, DIGEST_SIZE};

/// Server-issued material that lets the client prove its blocks were
/// encrypted under the revision's content key.
#[derive(Debug, Clone)]
pub struct VerificationInput {
    pub verification_code: Vec<u8>,
    /// Content key sealed to the node key
    pub content_key_packet: Vec<u8>,
}

/// One page of a revision's block listing.
#[derive(Debug, Clone)]
pub struct RevisionPage {
    pub revision: Revision,
    /// Blocks with `index >= from_index`, at most `page_size` of them
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
pub struct BlockCreation {
    pub index: u32,
    /// Data packet size in bytes
    pub size: usize,
    pub sha256: [u8; DIGEST_SIZE],
    pub encrypted_signature: Vec<u8>,
    pub verification_token: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SampleCreation {
    pub kind: SampleKind,
    pub size: usize,
    pub sha256: [u8; DIGEST_SIZE],
    /// Plaintext signature sealed to the node key
    pub encrypted_signature: Vec<u8>,
}

/// Registration of blocks and/or samples, answered with one upload target each.
#[derive(Debug, Clone)]
pub struct BlockUploadRequest {
    pub file: NodeIdentity,
    pub revision_id: RevisionId,
    pub address_id: AddressId,
    pub blocks: Vec<BlockCreation>,
    pub samples: Vec<SampleCreation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bare_url: String,
    pub token: String,
}

impl UploadTarget {
    pub fn url(&self) -> String {
        format!("{}/{}", self.bare_url.trim_end_matches('/'), self.token)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockUploadResponse {
    pub block_targets: Vec<UploadTarget>,
    pub sample_targets: Vec<UploadTarget>,
}

/// Commit of a draft: the signed manifest plus sealed extended attributes.
#[derive(Debug, Clone)]
pub struct FinalizeRevisionRequest {
    pub manifest_signature: Vec<u8>,
    pub signature_email: String,
    pub extended_attributes: Vec<u8>,
    /// Plaintext size in bytes
    pub size: u64,
}

/// The address a share member signs content with.
#[derive(Clone)]
pub struct SigningIdentity {
    pub address_id: AddressId,
    pub email: String,
    pub signing_key: SigningKey,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("address_id", &self.address_id)
            .field("email", &self.email)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Metadata service: revisions, block registration and node keys.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Create a draft revision. A draft that already exists is reported as
    /// [`ApiError::RevisionConflict`].
    async fn create_revision(
        &self,
        file: &NodeIdentity,
        current_revision_id: Option<&RevisionId>,
        client_id: &str,
    ) -> Result<RevisionId, ApiError>;

    async fn get_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        from_index: u32,
        page_size: u32,
    ) -> Result<RevisionPage, ApiError>;

    async fn request_block_upload(
        &self,
        request: BlockUploadRequest,
    ) -> Result<BlockUploadResponse, ApiError>;

    async fn finalize_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        request: FinalizeRevisionRequest,
    ) -> Result<(), ApiError>;

    async fn get_verification_input(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<VerificationInput, ApiError>;

    /// Unlocked private key of the file node.
    async fn get_node_key(&self, file: &NodeIdentity) -> Result<NodeKey, ApiError>;

    /// Content key packet of the file, sealed to its node key.
    async fn get_content_key_packet(&self, file: &NodeIdentity) -> Result<Vec<u8>, ApiError>;

    async fn delete_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<(), ApiError>;
}

/// Account service: address keys.
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Public keys of an address. Empty when the address has none.
    async fn address_public_keys(&self, email: &str) -> Result<Vec<VerifyingKey>, ApiError>;

    /// The caller's membership address on a share.
    async fn membership_address(&self, share_id: &ShareId) -> Result<SigningIdentity, ApiError>;
}
