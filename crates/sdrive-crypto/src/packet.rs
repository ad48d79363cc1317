//! Data packets: XChaCha20-Poly1305 encryption of one block under the content key
//!
//! Data packet format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! No AAD: block position is bound by the signed manifest, so a packet is
//! valid wherever it is stored and the manifest decides where it belongs.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::keys::ContentKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Keystream offset of the first ciphertext byte: block 0 keys Poly1305.
const PAYLOAD_KEYSTREAM_OFFSET: u64 = 64;

/// Encrypt a block's plaintext into a data packet.
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt_packet(content_key: &ContentKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(content_key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("data packet encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt and authenticate a full data packet.
pub fn decrypt_packet(content_key: &ContentKey, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
    if packet.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "data packet too short: {} bytes (minimum {})",
            packet.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = packet.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(content_key.as_bytes().into());

    cipher.decrypt(nonce, ciphertext).map_err(|_| {
        anyhow::anyhow!("data packet decryption failed: wrong content key or corrupted data")
    })
}

/// Decrypt up to `max_len` leading plaintext bytes from a packet prefix,
/// without authenticating the tag.
///
/// Only meaningful as a key check: it shows whether `packet_prefix` was
/// produced under `content_key`, by comparing against known plaintext.
pub fn decrypt_prefix(
    content_key: &ContentKey,
    packet_prefix: &[u8],
    max_len: usize,
) -> anyhow::Result<Vec<u8>> {
    if packet_prefix.len() < NONCE_SIZE {
        anyhow::bail!(
            "data packet prefix too short: {} bytes (minimum {NONCE_SIZE})",
            packet_prefix.len()
        );
    }

    let (nonce_bytes, body) = packet_prefix.split_at(NONCE_SIZE);
    let len = max_len.min(body.len());

    let mut cipher = XChaCha20::new(
        chacha20::Key::from_slice(content_key.as_bytes()),
        chacha20::XNonce::from_slice(nonce_bytes),
    );
    cipher.seek(PAYLOAD_KEYSTREAM_OFFSET);

    let mut out = body[..len].to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}
