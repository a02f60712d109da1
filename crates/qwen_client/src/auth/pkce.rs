//! PKCE (RFC 7636) verifier/challenge generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{QwenError, Result};

pub const VERIFIER_LEN: usize = 43;
pub const CHALLENGE_METHOD: &str = "S256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair from the operating system's CSPRNG.
    pub fn generate() -> Result<Self> {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self> {
        let mut bytes = [0u8; 32];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| QwenError::CryptoUnavailable(e.to_string()))?;

        let mut verifier = URL_SAFE_NO_PAD.encode(bytes);
        verifier.truncate(VERIFIER_LEN);
        let challenge = compute_code_challenge(&verifier);

        Ok(Self {
            verifier,
            challenge,
        })
    }
}

/// code_challenge = base64url_nopad(sha256(verifier)).
pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
