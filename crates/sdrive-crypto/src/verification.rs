//! Verification tokens: per-block proof that a data packet was produced
//! under the content key the server issued the verification code for.

use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the server-issued verification code.
pub const VERIFICATION_CODE_SIZE: usize = 32;

/// `token[i] = code[i] ^ packet[i]`, with packet bytes past its end taken as zero.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationToken(Vec<u8>);

impl VerificationToken {
    pub fn compute(verification_code: &[u8], packet_prefix: &[u8]) -> Self {
        let token = verification_code
            .iter()
            .enumerate()
            .map(|(i, code)| code ^ packet_prefix.get(i).copied().unwrap_or(0))
            .collect();
        Self(token)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerificationToken({} bytes)", self.0.len())
    }
}

/// Issue a fresh random verification code.
pub fn generate_verification_code() -> Vec<u8> {
    let mut code = vec![0u8; VERIFICATION_CODE_SIZE];
    OsRng.fill_bytes(&mut code);
    code
}
