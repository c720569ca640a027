//! PKCE (RFC 7636) challenge generation and verification

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Code challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeMethod {
    /// Challenge equals the verifier
    Plain,
    /// Challenge is `base64url(sha256(verifier))`
    S256,
}

impl ChallengeMethod {
    /// Parse a `code_challenge_method`. An absent method means `plain`.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.unwrap_or_default() {
            "" | "plain" => Some(Self::Plain),
            "S256" => Some(Self::S256),
            _ => None,
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }
}

/// Why a verifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PkceError {
    /// Verifier outside 43..=128 characters
    #[error("code_verifier must be between 43 and 128 characters")]
    Length,
    /// Verifier contains characters outside the unreserved set
    #[error("code_verifier contains invalid characters")]
    Charset,
    /// Unknown challenge method
    #[error("unsupported code_challenge_method")]
    Method,
    /// Verifier does not match the challenge
    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Check verifier length and charset.
///
/// # Errors
///
/// Returns [`PkceError::Length`] or [`PkceError::Charset`].
pub fn validate_verifier(verifier: &str) -> Result<(), PkceError> {
    if !(43..=128).contains(&verifier.len()) {
        return Err(PkceError::Length);
    }
    if !verifier.bytes().all(is_unreserved) {
        return Err(PkceError::Charset);
    }
    Ok(())
}

/// Compute the challenge for a verifier
#[must_use]
pub fn challenge(verifier: &str, method: ChallengeMethod) -> String {
    match method {
        ChallengeMethod::Plain => verifier.to_string(),
        ChallengeMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
    }
}

/// Verify a verifier against a stored challenge in constant time.
///
/// # Errors
///
/// Returns the first failed check.
pub fn verify_code_challenge(verifier: &str, expected: &str, method: ChallengeMethod) -> Result<(), PkceError> {
    validate_verifier(verifier)?;
    let computed = challenge(verifier, method);
    if bool::from(computed.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}

/// Generate an S256 verifier and challenge
#[must_use]
pub fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = challenge(&verifier, ChallengeMethod::S256);
    (verifier, challenge)
}

/// Random base64url token of `N` bytes
#[must_use]
pub fn random_token<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
