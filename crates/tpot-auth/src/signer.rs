//! Signed authorization tokens
//!
//! Token layout, before the outer base64:
//!
//! ```text
//! <nonce>\n<timestamp>\n<token>
//! ```
//!
//! - `nonce`: standard base64 of 32 random bytes
//! - `timestamp`: milliseconds since the Unix epoch, decimal
//! - `token`: standard base64 of PBKDF2-HMAC-SHA256(secret, salt, 32768, 128 bytes)
//!   where `salt` is the lowercase hex MD5 of `<nonce>\n<timestamp>`
//!
//! Both sides must agree on every parameter byte for byte.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Scheme prefix of the `Authorization` header value
pub const AUTH_SCHEME: &str = "TPoT-1";

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 32768;

/// Length of the derived key in bytes
pub const DERIVED_KEY_LEN: usize = 128;

/// Random bytes in a nonce, before base64
pub const NONCE_LEN: usize = 32;

/// Error types for token verification
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// Header does not use the expected scheme
    #[error("Unsupported authorization scheme")]
    UnsupportedScheme,

    /// Token could not be decoded
    #[error("Malformed authorization token: {0}")]
    Malformed(String),

    /// Token was derived from a different secret
    #[error("Authorization token does not match")]
    Mismatch,
}

/// Signs authorization headers with a shared secret
#[derive(Clone)]
pub struct CredentialSigner {
    secret: String,
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner").finish_non_exhaustive()
    }
}

impl CredentialSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Full `Authorization` header value with a fresh nonce and the current time
    pub fn authorization_header(&self) -> String {
        format!("{} {}", AUTH_SCHEME, self.sign())
    }

    /// Base64 auth string with a fresh nonce and the current time
    pub fn sign(&self) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        self.sign_with(&STANDARD.encode(nonce), Utc::now().timestamp_millis())
    }

    /// Deterministic variant of [`sign`](Self::sign)
    pub fn sign_with(&self, nonce: &str, timestamp_ms: i64) -> String {
        let salt_string = format!("{}\n{}", nonce, timestamp_ms);
        let token = derive_token(&self.secret, &salt_string);
        STANDARD.encode(format!("{}\n{}", salt_string, token))
    }
}

/// Fields recovered from a token that verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub nonce: String,
    pub timestamp_ms: i64,
}

/// Verify an `Authorization` header value against the shared secret.
///
/// Freshness and nonce reuse are left to the caller, which knows its own
/// replay window.
pub fn verify_authorization(
    secret: &str,
    header_value: &str,
) -> Result<VerifiedCredential, AuthError> {
    let encoded = header_value
        .strip_prefix(AUTH_SCHEME)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or(AuthError::UnsupportedScheme)?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    let auth_string =
        String::from_utf8(decoded).map_err(|e| AuthError::Malformed(e.to_string()))?;

    let mut parts = auth_string.splitn(3, '\n');
    let (nonce, timestamp, token) = match (parts.next(), parts.next(), parts.next()) {
        (Some(nonce), Some(timestamp), Some(token)) => (nonce, timestamp, token),
        _ => return Err(AuthError::Malformed("expected three fields".to_string())),
    };

    let timestamp_ms: i64 = timestamp
        .parse()
        .map_err(|_| AuthError::Malformed(format!("bad timestamp {:?}", timestamp)))?;

    let expected = derive_token(secret, &format!("{}\n{}", nonce, timestamp));
    if expected != token {
        return Err(AuthError::Mismatch);
    }

    Ok(VerifiedCredential {
        nonce: nonce.to_string(),
        timestamp_ms,
    })
}

fn derive_token(secret: &str, salt_string: &str) -> String {
    let salt = format!("{:x}", md5::compute(salt_string.as_bytes()));

    let mut derived = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        secret.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut derived,
    );

    STANDARD.encode(derived)
}
