//! Revision manifest
//!
//! The manifest is the byte concatenation of the SHA-256 digests of every
//! data packet, in ascending block index order, followed by the sample
//! digests. It is signed once with the address key; position in the
//! manifest is what binds a packet to its block index.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sdrive_core::VerificationStatus;

use crate::DIGEST_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    bytes: Vec<u8>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(digests: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(digests * DIGEST_SIZE),
        }
    }

    pub fn push_digest(&mut self, digest: &[u8; DIGEST_SIZE]) {
        self.bytes.extend_from_slice(digest);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest_count(&self) -> usize {
        self.bytes.len() / DIGEST_SIZE
    }

    /// Detached Ed25519 signature over the whole manifest.
    pub fn sign(&self, signing_key: &SigningKey) -> Vec<u8> {
        signing_key.sign(&self.bytes).to_bytes().to_vec()
    }

    /// Check `signature` against every key of the signer's keyring.
    ///
    /// An empty keyring yields `NoVerifier`; a signature that no key accepts
    /// (or that is malformed) yields `Failed`.
    pub fn verify(&self, signature: &[u8], keyring: &[VerifyingKey]) -> VerificationStatus {
        if keyring.is_empty() {
            return VerificationStatus::NoVerifier;
        }

        let Ok(signature) = Signature::from_slice(signature) else {
            tracing::debug!(len = signature.len(), "malformed manifest signature");
            return VerificationStatus::Failed;
        };

        if keyring
            .iter()
            .any(|key| key.verify_strict(&self.bytes, &signature).is_ok())
        {
            VerificationStatus::Ok
        } else {
            VerificationStatus::Failed
        }
    }
}

impl FromIterator<[u8; DIGEST_SIZE]> for Manifest {
    fn from_iter<I: IntoIterator<Item = [u8; DIGEST_SIZE]>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for digest in iter {
            manifest.push_digest(&digest);
        }
        manifest
    }
}
