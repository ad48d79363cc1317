//! sdrive-crypto: content encryption for the sdrive transfer engine
//!
//! Key roles:
//! ```text
//! Address key (Ed25519)      signs block plaintext and the revision manifest
//! Node key (X25519)          recipient of sealed material: content key packet,
//!                            block signatures, extended attributes
//! Content key (256-bit)      XChaCha20-Poly1305 over every block of a revision
//! ```
//!
//! Block pipeline: plaintext → sign → seal signature → encrypt → SHA-256 of data packet
//!
//! The manifest is the ordered concatenation of those SHA-256 digests, signed
//! once by the address key.

pub mod block;
pub mod keys;
pub mod manifest;
pub mod packet;
pub mod sealed;
pub mod verification;

pub use block::{decrypt_block, encrypt_block, DecryptedBlock, EncryptedBlock, PLAIN_PREFIX_LEN};
pub use keys::{generate_content_key, generate_signing_key, ContentKey, NodeKey, NodePublicKey};
pub use manifest::Manifest;
pub use packet::{decrypt_packet, decrypt_prefix, encrypt_packet};
pub use sealed::{open, open_content_key, seal, seal_content_key};
pub use verification::{generate_verification_code, VerificationToken, VERIFICATION_CODE_SIZE};

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Size of a content key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a SHA-256 digest
pub const DIGEST_SIZE: usize = 32;

/// Compute the SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; DIGEST_SIZE] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}
