//! Block encryption pipeline
//!
//! Upload: `plaintext → Ed25519 sign → seal signature to node key →
//! encrypt under content key → SHA-256(data packet)`. The leading plaintext
//! bytes are kept aside for the verifier, since the packet cannot be read back
//! without the content key.
//!
//! Download: `SHA-256(data packet) → decrypt → open + verify signature`.
//! A packet that fails authentication is an error; a signature that cannot be
//! checked is only a [`VerificationStatus`].

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sdrive_core::VerificationStatus;

use crate::keys::{ContentKey, NodeKey, NodePublicKey};
use crate::packet::{decrypt_packet, encrypt_packet};
use crate::sealed::{open, seal};
use crate::{sha256, DIGEST_SIZE};

/// Number of plaintext bytes retained for the verification prefix check.
pub const PLAIN_PREFIX_LEN: usize = 16;

/// Output of the upload pipeline for one block.
#[derive(Debug, Clone)]
pub struct EncryptedBlock {
    /// `[nonce][ciphertext][tag]`
    pub packet: Vec<u8>,
    /// SHA-256 of `packet`, the block's manifest entry
    pub sha256: [u8; DIGEST_SIZE],
    /// Plaintext signature sealed to the node key
    pub encrypted_signature: Vec<u8>,
    /// First `PLAIN_PREFIX_LEN` plaintext bytes (fewer for short blocks)
    pub plain_prefix: Vec<u8>,
    /// Plaintext length
    pub plain_len: usize,
}

/// Output of the download pipeline for one block.
#[derive(Debug, Clone)]
pub struct DecryptedBlock {
    pub plaintext: Vec<u8>,
    /// SHA-256 of the data packet as downloaded
    pub sha256: [u8; DIGEST_SIZE],
    /// Outcome of the per-block signature check
    pub verification: VerificationStatus,
}

pub fn encrypt_block(
    content_key: &ContentKey,
    signing_key: &SigningKey,
    node_key: &NodePublicKey,
    plaintext: &[u8],
) -> anyhow::Result<EncryptedBlock> {
    let plain_prefix = plaintext[..plaintext.len().min(PLAIN_PREFIX_LEN)].to_vec();

    let signature = signing_key.sign(plaintext);
    let encrypted_signature = seal(node_key, &signature.to_bytes())?;

    let packet = encrypt_packet(content_key, plaintext)?;
    let sha256 = sha256(&packet);

    Ok(EncryptedBlock {
        packet,
        sha256,
        encrypted_signature,
        plain_prefix,
        plain_len: plaintext.len(),
    })
}

/// Decrypt one data packet and check its signature.
///
/// `verifying_keys` is the signer's keyring; `encrypted_signature` is the
/// sealed signature recorded with the block, if any.
pub fn decrypt_block(
    content_key: &ContentKey,
    packet: &[u8],
    encrypted_signature: Option<&[u8]>,
    node_key: &NodeKey,
    verifying_keys: &[VerifyingKey],
) -> anyhow::Result<DecryptedBlock> {
    let sha256 = sha256(packet);
    let plaintext = decrypt_packet(content_key, packet)?;

    let verification = match encrypted_signature {
        None => VerificationStatus::NotSigned,
        Some(_) if verifying_keys.is_empty() => VerificationStatus::NoVerifier,
        Some(sealed) => verify_signature(&plaintext, sealed, node_key, verifying_keys),
    };

    Ok(DecryptedBlock {
        plaintext,
        sha256,
        verification,
    })
}

fn verify_signature(
    plaintext: &[u8],
    sealed_signature: &[u8],
    node_key: &NodeKey,
    verifying_keys: &[VerifyingKey],
) -> VerificationStatus {
    // A signature not sealed to this node belongs to another context.
    let Ok(raw) = open(node_key, sealed_signature) else {
        return VerificationStatus::BadContext;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return VerificationStatus::Failed;
    };

    if verifying_keys
        .iter()
        .any(|key| key.verify_strict(plaintext, &signature).is_ok())
    {
        VerificationStatus::Ok
    } else {
        VerificationStatus::Failed
    }
}
