/// API key generation and PBKDF2-HMAC-SHA-256 hashing.
///
/// Stored hashes use the format `pbkdf2_sha256$<iterations>$<salt_b64>$<digest_b64>`
/// with standard (not URL-safe) base64. Verification honors the iteration
/// count and salt embedded in each stored hash and compares digests in
/// constant time. The cleartext key itself is never persisted.
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use bansho_types::BanshoError;

pub const PBKDF2_SCHEME: &str = "pbkdf2_sha256";
pub const PBKDF2_ITERATIONS: u32 = 210_000;
pub const API_KEY_PREFIX: &str = "msl_";

const SALT_BYTES: usize = 16;
const DIGEST_BYTES: usize = 32;
const TOKEN_BYTES: usize = 32;

/// Generate a cleartext API key: `msl_` + base64-url (no padding) of 32
/// random bytes.
pub fn generate_api_key() -> Result<String, BanshoError> {
    let mut token = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut token)
        .map_err(|e| BanshoError::Credential(format!("random source failed: {e}")))?;
    Ok(format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(token)))
}

/// Hash an API key with the default iteration count.
pub fn hash_api_key(api_key: &str) -> Result<String, BanshoError> {
    hash_api_key_with_iterations(api_key, PBKDF2_ITERATIONS)
}

/// Hash an API key with an explicit iteration count and a fresh 16-byte salt.
pub fn hash_api_key_with_iterations(
    api_key: &str,
    iterations: u32,
) -> Result<String, BanshoError> {
    if iterations == 0 {
        return Err(BanshoError::Credential(
            "PBKDF2 iterations must be greater than 0".to_string(),
        ));
    }

    let mut salt = [0u8; SALT_BYTES];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| BanshoError::Credential(format!("random source failed: {e}")))?;

    let mut digest = [0u8; DIGEST_BYTES];
    pbkdf2_hmac::<Sha256>(api_key.as_bytes(), &salt, iterations, &mut digest);

    Ok(format!(
        "{PBKDF2_SCHEME}${iterations}${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(digest)
    ))
}

/// Verify a presented key against a stored hash.
///
/// Malformed hashes verify as `false` rather than erroring — a corrupt row
/// must not let a request through, and must not take the resolver down.
pub fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    let mut parts = stored_hash.splitn(4, '$');
    let (scheme, iterations_text, salt_b64, digest_b64) = match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return false,
    };

    if scheme != PBKDF2_SCHEME {
        return false;
    }
    let iterations: u32 = match iterations_text.parse() {
        Ok(n) if n >= 1 => n,
        _ => return false,
    };
    let salt = match STANDARD.decode(salt_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let expected = match STANDARD.decode(digest_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut actual = vec![0u8; expected.len().max(1)];
    pbkdf2_hmac::<Sha256>(api_key.as_bytes(), &salt, iterations, &mut actual);
    actual.ct_eq(&expected).into()
}
