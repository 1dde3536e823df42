//! Consumer credential generation, hashing, and verification.
//!
//! A consumer token is `<key_id>.<secret>` where `key_id` is public and
//! lookupable (`kid_` + 10 url-safe bytes) and the secret is opaque (`db_` +
//! 32 url-safe bytes). The server stores only the key id plus a salted
//! PBKDF2-HMAC-SHA256 digest of the full token; the plaintext is shown once
//! at provisioning time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// PBKDF2 iteration count for credential hashing.
const PBKDF2_ITERATIONS: u32 = 210_000;

/// Length of the PBKDF2 salt in bytes.
const SALT_LEN: usize = 16;

/// Length of the PBKDF2 digest in bytes.
const DIGEST_LEN: usize = 32;

/// Number of random bytes in a key id.
const KEY_ID_LEN: usize = 10;

/// Number of random bytes in a secret.
const SECRET_LEN: usize = 32;

/// Salted digest of a consumer token, both parts base64url encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHash {
    /// Base64url-encoded salt.
    pub salt: String,
    /// Base64url-encoded PBKDF2 digest.
    pub digest: String,
}

/// Generate a fresh public key identifier (`kid_…`).
pub fn generate_key_id() -> String {
    let mut bytes = [0u8; KEY_ID_LEN];
    rand::rng().fill(&mut bytes[..]);
    format!("kid_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a fresh opaque secret (`db_…`).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rng().fill(&mut bytes[..]);
    format!("db_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Split a presented token into its key id prefix.
///
/// The key id is everything before the first `.`; a token without a dot is
/// treated as a bare key id so lookup still works (verification will fail).
pub fn key_id_of(token: &str) -> &str {
    token.split_once('.').map(|(kid, _)| kid).unwrap_or(token)
}

/// Hash a full token with a fresh random salt.
pub fn hash_token(token: &str) -> KeyHash {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill(&mut salt[..]);

    let mut digest = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha256>(token.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut digest);

    KeyHash {
        salt: URL_SAFE_NO_PAD.encode(salt),
        digest: URL_SAFE_NO_PAD.encode(digest),
    }
}

/// Verify a presented token against stored credential material.
///
/// The digest comparison is constant-time; malformed stored material simply
/// fails verification.
pub fn verify_token(token: &str, salt: &str, digest: &str) -> bool {
    let Ok(salt) = URL_SAFE_NO_PAD.decode(salt) else {
        return false;
    };
    let Ok(expected) = URL_SAFE_NO_PAD.decode(digest) else {
        return false;
    };
    if expected.len() != DIGEST_LEN {
        return false;
    }

    let mut actual = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha256>(token.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut actual);

    actual.ct_eq(expected.as_slice()).into()
}
