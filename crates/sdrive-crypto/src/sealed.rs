//! Sealed boxes: anonymous encryption to a node's X25519 public key
//!
//! Sealed format (binary):
//! ```text
//! [32 bytes: ephemeral public key][24 bytes: nonce][ciphertext + 16-byte tag]
//! key = HKDF-SHA256(ikm = ECDH(ephemeral, recipient),
//!                   salt = ephemeral_pk || recipient_pk,
//!                   info = "sdrive-seal-v1")
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::keys::{ContentKey, NodeKey, NodePublicKey};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const SEAL_INFO: &[u8] = b"sdrive-seal-v1";
const HEADER_SIZE: usize = KEY_SIZE + NONCE_SIZE;

/// Encrypt `plaintext` so that only the holder of `recipient`'s private key can read it.
pub fn seal(recipient: &NodePublicKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pk = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.0);

    let mut key = derive_seal_key(shared.as_bytes(), ephemeral_pk.as_bytes(), recipient.as_bytes())?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| anyhow::anyhow!("sealing failed: {e}"))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    result.extend_from_slice(ephemeral_pk.as_bytes());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a sealed box with the recipient's node key.
pub fn open(node_key: &NodeKey, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < HEADER_SIZE + TAG_SIZE {
        anyhow::bail!(
            "sealed box too short: {} bytes (minimum {})",
            sealed.len(),
            HEADER_SIZE + TAG_SIZE
        );
    }

    let (ephemeral_bytes, rest) = sealed.split_at(KEY_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut ephemeral = [0u8; KEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_pk = PublicKey::from(ephemeral);

    let shared = node_key.secret().diffie_hellman(&ephemeral_pk);
    let recipient_pk = node_key.public_key();

    let mut key = derive_seal_key(shared.as_bytes(), ephemeral_pk.as_bytes(), recipient_pk.as_bytes())?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| anyhow::anyhow!("opening sealed box failed: not addressed to this key or corrupted"))
}

/// Produce a content key packet: the content key sealed to the node key.
pub fn seal_content_key(recipient: &NodePublicKey, content_key: &ContentKey) -> anyhow::Result<Vec<u8>> {
    seal(recipient, content_key.as_bytes())
}

/// Recover the content key from its packet.
pub fn open_content_key(node_key: &NodeKey, packet: &[u8]) -> anyhow::Result<ContentKey> {
    let mut plaintext = open(node_key, packet)?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        anyhow::bail!(
            "content key packet has wrong size: {} bytes (expected {KEY_SIZE})",
            plaintext.len()
        );
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(ContentKey::from_bytes(key_bytes))
}

fn derive_seal_key(
    shared: &[u8; KEY_SIZE],
    ephemeral_pk: &[u8; KEY_SIZE],
    recipient_pk: &[u8; KEY_SIZE],
) -> anyhow::Result<[u8; KEY_SIZE]> {
    let mut salt = [0u8; 2 * KEY_SIZE];
    salt[..KEY_SIZE].copy_from_slice(ephemeral_pk);
    salt[KEY_SIZE..].copy_from_slice(recipient_pk);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(SEAL_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}
