//! In-process drive: [`DriveApi`] + [`AccountApi`] over a [`BlobStore`]
//!
//! Keeps revision metadata in memory and block ciphertext in the blob store.
//! It enforces the server side of the transfer protocol: drafts are the only
//! writable revisions, a second draft is reported as a conflict naming its
//! client, and finalize checks every uploaded blob against its registered
//! digest, size and verification token.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sdrive_core::config::{StorageConfig, TransferConfig};
use sdrive_core::{
    AddressId, ApiError, Block, NodeId, NodeIdentity, Revision, RevisionConflict, RevisionId,
    RevisionState, SampleKind, ShareId, VolumeId,
};
use sdrive_crypto::{
    generate_content_key, generate_signing_key, generate_verification_code, seal_content_key,
    sha256, NodeKey, VerificationToken, VerifyingKey, DIGEST_SIZE,
};
use sdrive_storage::{blob_url, build_operator, BlobStore, OperatorBlobStore};
use tracing::{debug, warn};

use crate::api::{
    AccountApi, BlockUploadRequest, BlockUploadResponse, DriveApi, FinalizeRevisionRequest,
    RevisionPage, SigningIdentity, UploadTarget, VerificationInput,
};
use crate::client::{Collaborators, TransferClient};
use crate::secrets::InMemorySecretsCache;

const REJECTED_STATE: u32 = 2501;
const REJECTED_INTEGRITY: u32 = 2511;

struct StoredBlock {
    url: String,
    size: usize,
    sha256: [u8; DIGEST_SIZE],
    encrypted_signature: Vec<u8>,
    signature_email: String,
    verification_token: Vec<u8>,
}

struct StoredSample {
    url: String,
    size: usize,
    sha256: [u8; DIGEST_SIZE],
    encrypted_signature: Vec<u8>,
}

struct RevisionRecord {
    revision: Revision,
    draft_client_id: String,
    verification_code: Vec<u8>,
    blocks: BTreeMap<u32, StoredBlock>,
    samples: BTreeMap<SampleKind, StoredSample>,
    extended_attributes: Option<Vec<u8>>,
}

impl RevisionRecord {
    fn urls(&self) -> Vec<String> {
        self.blocks
            .values()
            .map(|b| b.url.clone())
            .chain(self.samples.values().map(|s| s.url.clone()))
            .collect()
    }
}

struct FileRecord {
    node_key: NodeKey,
    content_key_packet: Vec<u8>,
    revisions: HashMap<RevisionId, RevisionRecord>,
}

impl FileRecord {
    fn draft(&self) -> Option<&RevisionRecord> {
        self.revisions.values().find(|r| r.revision.is_draft())
    }

    fn active_id(&self) -> Option<RevisionId> {
        self.revisions
            .values()
            .find(|r| r.revision.state == RevisionState::Active)
            .map(|r| r.revision.id.clone())
    }
}

#[derive(Default)]
struct DriveState {
    files: HashMap<NodeIdentity, FileRecord>,
    address_keys: HashMap<String, Vec<VerifyingKey>>,
    address_emails: HashMap<AddressId, String>,
}

/// Expected content of one uploaded blob, checked at finalize.
struct BlobCheck {
    what: String,
    url: String,
    size: usize,
    sha256: [u8; DIGEST_SIZE],
    token: Option<(Vec<u8>, Vec<u8>)>,
}

pub struct LoopbackDrive {
    blobs: Arc<dyn BlobStore>,
    owner: SigningIdentity,
    state: Mutex<DriveState>,
}

impl std::fmt::Debug for LoopbackDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackDrive")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl LoopbackDrive {
    /// A drive whose only member is a freshly generated owner address.
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        let owner = SigningIdentity {
            address_id: AddressId::new(uuid::Uuid::new_v4().to_string()),
            email: "owner@sdrive.test".into(),
            signing_key: generate_signing_key(),
        };

        let mut state = DriveState::default();
        state
            .address_keys
            .insert(owner.email.clone(), vec![owner.signing_key.verifying_key()]);
        state
            .address_emails
            .insert(owner.address_id.clone(), owner.email.clone());

        Self {
            blobs,
            owner,
            state: Mutex::new(state),
        }
    }

    /// A drive over an in-memory OpenDAL operator.
    pub fn in_memory() -> anyhow::Result<Arc<Self>> {
        let op = build_operator(&StorageConfig::default(), None)?;
        Ok(Arc::new(Self::new(Arc::new(OperatorBlobStore::new(op)))))
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            api: self.clone(),
            account: self.clone(),
            blobs: Arc::clone(&self.blobs),
            secrets: Arc::new(InMemorySecretsCache::new()),
        }
    }

    /// A transfer client talking to this drive, with its own secrets cache.
    pub fn client(self: &Arc<Self>, config: TransferConfig) -> TransferClient {
        TransferClient::new(config, self.collaborators())
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn owner(&self) -> &SigningIdentity {
        &self.owner
    }

    fn lock(&self) -> MutexGuard<'_, DriveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty file node on `share`, with its own node key and
    /// content key.
    pub fn create_file(&self, share: &str) -> anyhow::Result<NodeIdentity> {
        let node_key = NodeKey::generate();
        let content_key_packet = seal_content_key(&node_key.public_key(), &generate_content_key())?;
        let file = NodeIdentity {
            volume_id: VolumeId::new("loopback"),
            share_id: ShareId::new(share),
            node_id: NodeId::new(uuid::Uuid::new_v4().to_string()),
        };

        self.lock().files.insert(
            file.clone(),
            FileRecord {
                node_key,
                content_key_packet,
                revisions: HashMap::new(),
            },
        );
        debug!(node = %file.node_id, share, "loopback file created");
        Ok(file)
    }

    /// Node key of a file, as the owner would unlock it.
    pub fn node_key(&self, file: &NodeIdentity) -> Option<NodeKey> {
        self.lock().files.get(file).map(|f| f.node_key.clone())
    }

    /// Sealed extended attributes submitted at finalize.
    pub fn extended_attributes(&self, file: &NodeIdentity, revision_id: &RevisionId) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(file)?
            .revisions
            .get(revision_id)?
            .extended_attributes
            .clone()
    }

    /// Blob URLs of a revision's blocks, in index order.
    pub fn block_urls(&self, file: &NodeIdentity, revision_id: &RevisionId) -> Vec<String> {
        self.with_revision(file, revision_id, |record| {
            record.blocks.values().map(|b| b.url.clone()).collect()
        })
        .unwrap_or_default()
    }

    /// Blob URL and sealed signature of a revision's sample.
    pub fn sample(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        kind: SampleKind,
    ) -> Option<(String, Vec<u8>)> {
        self.with_revision(file, revision_id, |record| {
            record
                .samples
                .get(&kind)
                .map(|s| (s.url.clone(), s.encrypted_signature.clone()))
        })
        .flatten()
    }

    /// Drop block `index` from a revision's listing.
    pub fn remove_block(&self, file: &NodeIdentity, revision_id: &RevisionId, index: u32) -> bool {
        self.with_revision(file, revision_id, |record| record.blocks.remove(&index).is_some())
            .unwrap_or(false)
    }

    /// Replace a file's content key packet, as if the key were rotated.
    pub fn replace_content_key_packet(&self, file: &NodeIdentity, packet: Vec<u8>) {
        if let Some(record) = self.lock().files.get_mut(file) {
            record.content_key_packet = packet;
        }
    }

    /// Forget a revision's manifest signature.
    pub fn strip_manifest_signature(&self, file: &NodeIdentity, revision_id: &RevisionId) {
        self.with_revision(file, revision_id, |record| {
            record.revision.manifest_signature = None;
        });
    }

    /// Forget every public key of an address.
    pub fn remove_address_keys(&self, email: &str) {
        self.lock().address_keys.remove(email);
    }

    fn with_revision<T>(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        f: impl FnOnce(&mut RevisionRecord) -> T,
    ) -> Option<T> {
        let mut state = self.lock();
        let record = state.files.get_mut(file)?.revisions.get_mut(revision_id)?;
        Some(f(record))
    }

    /// Compare each uploaded blob with what was registered for it.
    async fn check_blobs(&self, checks: Vec<BlobCheck>) -> Result<(), ApiError> {
        for check in checks {
            let data = self
                .blobs
                .get(&check.url)
                .await
                .map_err(|e| ApiError::Transport(format!("{}: {e:#}", check.what)))?;

            if data.len() != check.size || sha256(&data) != check.sha256 {
                return Err(rejected(
                    REJECTED_INTEGRITY,
                    format!("{} does not match its registered digest", check.what),
                ));
            }
            if let Some((code, token)) = &check.token {
                if VerificationToken::compute(code, &data).as_bytes() != token.as_slice() {
                    warn!(block = %check.what, "verification token rejected");
                    return Err(rejected(
                        REJECTED_INTEGRITY,
                        format!("{} has an invalid verification token", check.what),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn rejected(code: u32, message: impl Into<String>) -> ApiError {
    ApiError::Rejected {
        code,
        message: message.into(),
    }
}

fn not_found(what: impl std::fmt::Display) -> ApiError {
    ApiError::NotFound(what.to_string())
}

fn file_record<'a>(state: &'a DriveState, file: &NodeIdentity) -> Result<&'a FileRecord, ApiError> {
    state
        .files
        .get(file)
        .ok_or_else(|| not_found(format!("file {}", file.node_id)))
}

fn revision_record<'a>(
    state: &'a mut DriveState,
    file: &NodeIdentity,
    revision_id: &RevisionId,
) -> Result<&'a mut RevisionRecord, ApiError> {
    state
        .files
        .get_mut(file)
        .ok_or_else(|| not_found(format!("file {}", file.node_id)))?
        .revisions
        .get_mut(revision_id)
        .ok_or_else(|| not_found(format!("revision {revision_id}")))
}

fn require_draft(record: &RevisionRecord) -> Result<(), ApiError> {
    if !record.revision.is_draft() {
        return Err(rejected(
            REJECTED_STATE,
            format!("revision {} is not a draft", record.revision.id),
        ));
    }
    Ok(())
}

#[async_trait]
impl DriveApi for LoopbackDrive {
    async fn create_revision(
        &self,
        file: &NodeIdentity,
        current_revision_id: Option<&RevisionId>,
        client_id: &str,
    ) -> Result<RevisionId, ApiError> {
        let mut state = self.lock();
        let record = state
            .files
            .get_mut(file)
            .ok_or_else(|| not_found(format!("file {}", file.node_id)))?;

        if let Some(draft) = record.draft() {
            return Err(ApiError::RevisionConflict(RevisionConflict {
                conflicting_revision_id: None,
                draft_revision_id: Some(draft.revision.id.clone()),
                draft_client_id: Some(draft.draft_client_id.clone()),
            }));
        }
        let active = record.active_id();
        if current_revision_id.is_some() && current_revision_id != active.as_ref() {
            return Err(ApiError::RevisionConflict(RevisionConflict {
                conflicting_revision_id: active,
                ..Default::default()
            }));
        }

        let id = RevisionId::new(uuid::Uuid::new_v4().to_string());
        let creation_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        record.revisions.insert(
            id.clone(),
            RevisionRecord {
                revision: Revision::draft(
                    id.clone(),
                    file.node_id.clone(),
                    file.volume_id.clone(),
                    creation_time,
                ),
                draft_client_id: client_id.to_string(),
                verification_code: generate_verification_code(),
                blocks: BTreeMap::new(),
                samples: BTreeMap::new(),
                extended_attributes: None,
            },
        );
        debug!(revision = %id, client_id, "draft revision created");
        Ok(id)
    }

    async fn get_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        from_index: u32,
        page_size: u32,
    ) -> Result<RevisionPage, ApiError> {
        let mut state = self.lock();
        let record = revision_record(&mut state, file, revision_id)?;

        let blocks = record
            .blocks
            .range(from_index..)
            .take(page_size as usize)
            .map(|(index, stored)| Block {
                index: *index,
                url: stored.url.clone(),
                encrypted_signature: Some(stored.encrypted_signature.clone()),
                signature_email: Some(stored.signature_email.clone()),
            })
            .collect();

        Ok(RevisionPage {
            revision: record.revision.clone(),
            blocks,
        })
    }

    async fn request_block_upload(
        &self,
        request: BlockUploadRequest,
    ) -> Result<BlockUploadResponse, ApiError> {
        let mut state = self.lock();
        let email = state
            .address_emails
            .get(&request.address_id)
            .cloned()
            .ok_or_else(|| not_found(format!("address {}", request.address_id)))?;
        let record = revision_record(&mut state, &request.file, &request.revision_id)?;
        require_draft(record)?;

        let bare_url = blob_url(&format!(
            "blocks/{}/{}",
            request.file.volume_id, request.revision_id
        ));
        let mut response = BlockUploadResponse::default();

        for block in request.blocks {
            let target = UploadTarget {
                bare_url: bare_url.clone(),
                token: format!("{}-{}", block.index, uuid::Uuid::new_v4()),
            };
            record.blocks.insert(
                block.index,
                StoredBlock {
                    url: target.url(),
                    size: block.size,
                    sha256: block.sha256,
                    encrypted_signature: block.encrypted_signature,
                    signature_email: email.clone(),
                    verification_token: block.verification_token,
                },
            );
            response.block_targets.push(target);
        }

        for sample in request.samples {
            let target = UploadTarget {
                bare_url: bare_url.clone(),
                token: format!("sample-{}-{}", sample.kind as u8, uuid::Uuid::new_v4()),
            };
            record.samples.insert(
                sample.kind,
                StoredSample {
                    url: target.url(),
                    size: sample.size,
                    sha256: sample.sha256,
                    encrypted_signature: sample.encrypted_signature,
                },
            );
            response.sample_targets.push(target);
        }

        Ok(response)
    }

    async fn finalize_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        request: FinalizeRevisionRequest,
    ) -> Result<(), ApiError> {
        let checks = {
            let mut state = self.lock();
            let record = revision_record(&mut state, file, revision_id)?;
            require_draft(record)?;

            for (expected, index) in (1u32..).zip(record.blocks.keys()) {
                if *index != expected {
                    return Err(rejected(
                        REJECTED_INTEGRITY,
                        format!("block {expected} was never uploaded"),
                    ));
                }
            }

            let code = record.verification_code.clone();
            record
                .blocks
                .iter()
                .map(|(index, b)| BlobCheck {
                    what: format!("block {index}"),
                    url: b.url.clone(),
                    size: b.size,
                    sha256: b.sha256,
                    token: Some((code.clone(), b.verification_token.clone())),
                })
                .chain(record.samples.iter().map(|(kind, s)| BlobCheck {
                    what: format!("sample {kind:?}"),
                    url: s.url.clone(),
                    size: s.size,
                    sha256: s.sha256,
                    token: None,
                }))
                .collect::<Vec<_>>()
        };

        self.check_blobs(checks).await?;

        let mut state = self.lock();
        let file_record = state
            .files
            .get_mut(file)
            .ok_or_else(|| not_found(format!("file {}", file.node_id)))?;
        for other in file_record.revisions.values_mut() {
            if other.revision.state == RevisionState::Active {
                other.revision.state = RevisionState::Obsolete;
            }
        }

        let record = file_record
            .revisions
            .get_mut(revision_id)
            .ok_or_else(|| not_found(format!("revision {revision_id}")))?;
        // Drafts cannot be finalized twice, even across the unlocked check.
        require_draft(record)?;

        let quota = record.blocks.values().map(|b| b.size as u64).sum::<u64>()
            + record.samples.values().map(|s| s.size as u64).sum::<u64>();
        let revision = &mut record.revision;
        revision.state = RevisionState::Active;
        revision.size = request.size;
        revision.quota_consumption = quota;
        revision.manifest_signature = Some(request.manifest_signature);
        revision.signature_email = Some(request.signature_email);
        revision.samples_sha256_digests = record.samples.values().map(|s| s.sha256).collect();
        record.extended_attributes = Some(request.extended_attributes);

        debug!(revision = %revision_id, blocks = record.blocks.len(), "revision committed");
        Ok(())
    }

    async fn get_verification_input(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<VerificationInput, ApiError> {
        let mut state = self.lock();
        let record = revision_record(&mut state, file, revision_id)?;
        require_draft(record)?;
        let verification_code = record.verification_code.clone();

        let content_key_packet = file_record(&state, file)?.content_key_packet.clone();
        Ok(VerificationInput {
            verification_code,
            content_key_packet,
        })
    }

    async fn get_node_key(&self, file: &NodeIdentity) -> Result<NodeKey, ApiError> {
        Ok(file_record(&self.lock(), file)?.node_key.clone())
    }

    async fn get_content_key_packet(&self, file: &NodeIdentity) -> Result<Vec<u8>, ApiError> {
        Ok(file_record(&self.lock(), file)?.content_key_packet.clone())
    }

    async fn delete_revision(
        &self,
        file: &NodeIdentity,
        revision_id: &RevisionId,
    ) -> Result<(), ApiError> {
        let urls = {
            let mut state = self.lock();
            let record = revision_record(&mut state, file, revision_id)?;
            if record.revision.state == RevisionState::Active {
                return Err(rejected(
                    REJECTED_STATE,
                    format!("revision {revision_id} is the active revision"),
                ));
            }
            let urls = record.urls();
            if let Some(file_record) = state.files.get_mut(file) {
                file_record.revisions.remove(revision_id);
            }
            urls
        };

        for url in urls {
            if let Err(e) = self.blobs.delete(&url).await {
                warn!(url, error = %e, "failed to delete blob of removed revision");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccountApi for LoopbackDrive {
    async fn address_public_keys(&self, email: &str) -> Result<Vec<VerifyingKey>, ApiError> {
        Ok(self.lock().address_keys.get(email).cloned().unwrap_or_default())
    }

    async fn membership_address(&self, _share_id: &ShareId) -> Result<SigningIdentity, ApiError> {
        Ok(self.owner.clone())
    }
}
