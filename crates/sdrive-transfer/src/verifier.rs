//! Block verification: check our own ciphertext against the server's
//! content key before spending bandwidth on it.

use sdrive_core::{NodeIdentity, RevisionId, TransferError, TransferResult};
use sdrive_crypto::{
    decrypt_prefix, open_content_key, ContentKey, NodeKey, VerificationToken, NONCE_SIZE,
    PLAIN_PREFIX_LEN,
};

use crate::api::DriveApi;

pub struct BlockVerifier {
    verification_code: Vec<u8>,
    content_key: ContentKey,
}

impl std::fmt::Debug for BlockVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockVerifier")
            .field("code_len", &self.verification_code.len())
            .finish_non_exhaustive()
    }
}

impl BlockVerifier {
    /// Fetch the revision's verification material and open its content key
    /// with `node_key`.
    ///
    /// Fails with [`TransferError::KeyMismatch`] when the recorded content
    /// key was not sealed to `node_key`.
    pub async fn create(
        api: &dyn DriveApi,
        file: &NodeIdentity,
        revision_id: &RevisionId,
        node_key: &NodeKey,
    ) -> TransferResult<Self> {
        let input = api.get_verification_input(file, revision_id).await?;
        let content_key = open_content_key(node_key, &input.content_key_packet)
            .map_err(|_| TransferError::KeyMismatch)?;

        Ok(Self {
            verification_code: input.verification_code,
            content_key,
        })
    }

    pub fn from_parts(verification_code: Vec<u8>, content_key: ContentKey) -> Self {
        Self {
            verification_code,
            content_key,
        }
    }

    /// Maximum number of plaintext bytes compared by [`verify_block`](Self::verify_block).
    pub fn prefix_len(&self) -> usize {
        PLAIN_PREFIX_LEN
    }

    /// Number of leading data packet bytes the verifier needs.
    pub fn packet_prefix_len(&self) -> usize {
        NONCE_SIZE + self.verification_code.len().max(PLAIN_PREFIX_LEN)
    }

    /// Decrypt the start of block `index`'s data packet and compare it with
    /// the plaintext it was made from, then derive the verification token.
    pub fn verify_block(
        &self,
        index: u32,
        packet_prefix: &[u8],
        plain_prefix: &[u8],
    ) -> TransferResult<VerificationToken> {
        let plain_prefix = &plain_prefix[..plain_prefix.len().min(PLAIN_PREFIX_LEN)];

        let decrypted = decrypt_prefix(&self.content_key, packet_prefix, plain_prefix.len())
            .map_err(|_| TransferError::DataPacketMismatch { index })?;
        if decrypted != plain_prefix {
            return Err(TransferError::DataPacketMismatch { index });
        }

        let packet_prefix = &packet_prefix[..packet_prefix.len().min(self.packet_prefix_len())];
        Ok(VerificationToken::compute(&self.verification_code, packet_prefix))
    }
}
