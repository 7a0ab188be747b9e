//! Authentication for the TPoT tunnel
//!
//! The relay authenticates a tunnel client from a single upgrade header. The
//! header proves knowledge of a shared secret without sending it, and carries a
//! nonce and timestamp so the relay can reject replays.

pub mod signer;

pub use signer::{
    verify_authorization, AuthError, CredentialSigner, VerifiedCredential, AUTH_SCHEME,
    DERIVED_KEY_LEN, NONCE_LEN, PBKDF2_ITERATIONS,
};
