// Hashing, token and clock helpers used by the schema engine and storage layer

use crate::error::{Result, ShelfError};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use blake3::Hasher;
use rand::rngs::OsRng;

const INDEX_DIGEST_DOMAIN: &str = "shelfdb:index:v1";
const TEXT_DIGEST_DOMAIN: &str = "shelfdb:text:v1";

const HEX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

const ALPHANUMERIC_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

fn domain_digest(domain: &str, bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// Hex digest naming a unique-index entry for `value`.
pub fn index_digest(value: &str) -> String {
    domain_digest(INDEX_DIGEST_DOMAIN, value.as_bytes())
}

/// Hex digest of text content, compared to detect changes in `text` fields.
pub fn text_digest(value: &str) -> String {
    domain_digest(TEXT_DIGEST_DOMAIN, value.as_bytes())
}

/// One-way password hash as an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ShelfError::Password(e.to_string()))
}

/// Checks `candidate` against a hash produced by [`hash_password`].
/// A malformed stored hash never verifies.
pub fn verify_password(stored_hash: &str, candidate: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Fixed-length lowercase hex token.
pub fn hex_token(length: usize) -> String {
    nanoid::nanoid!(length, &HEX_ALPHABET)
}

/// Fixed-length alphanumeric token.
pub fn alphanumeric_token(length: usize) -> String {
    nanoid::nanoid!(length, &ALPHANUMERIC_ALPHABET)
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests_are_stable_and_domain_separated() {
        assert_eq!(index_digest("tom@hello.com"), index_digest("tom@hello.com"));
        assert_ne!(index_digest("tom@hello.com"), index_digest("cici@hello.com"));
        assert_ne!(index_digest("tom@hello.com"), text_digest("tom@hello.com"));
        assert_eq!(index_digest("x").len(), 64);
    }

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("s3cret").unwrap();
        assert_ne!(hash, "s3cret");
        assert!(verify_password(&hash, "s3cret"));
        assert!(!verify_password(&hash, "guess"));
        assert!(!verify_password("not-a-hash", "s3cret"));
    }

    #[test]
    fn test_tokens() {
        let id = hex_token(24);
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let token = alphanumeric_token(8);
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
