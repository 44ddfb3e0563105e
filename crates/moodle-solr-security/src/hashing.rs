//! Password hashing in the format of Solr's `BasicAuthPlugin`.
//!
//! Solr stores `base64(sha256(sha256(salt || password))) base64(salt)` per user.

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::document::SecurityDocument;

const SALT_LENGTH: usize = 32;

/// Turns a plaintext secret into the opaque string stored in the security
/// document.
pub trait SecretHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> String;
}

/// Salted double SHA-256, as understood by `solr.BasicAuthPlugin`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolrBasicAuthHasher;

impl SecretHasher for SolrBasicAuthHasher {
    fn hash(&self, plaintext: &str) -> String {
        let salt: [u8; SALT_LENGTH] = rand::random();
        hash_with_salt(plaintext, &salt)
    }
}

pub fn hash_with_salt(plaintext: &str, salt: &[u8]) -> String {
    let digest = double_sha256(plaintext, salt);
    format!("{} {}", STANDARD.encode(digest), STANDARD.encode(salt))
}

/// Checks `plaintext` against a stored `"<hash> <salt>"` credential. Malformed
/// credentials never match.
pub fn verify(plaintext: &str, stored: &str) -> bool {
    let mut parts = stored.split_whitespace();
    let (Some(hash), Some(salt), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let (Ok(expected), Ok(salt)) = (STANDARD.decode(hash), STANDARD.decode(salt)) else {
        return false;
    };

    let actual = double_sha256(plaintext, &salt);
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Returns the credential already stored for `username` if it matches
/// `plaintext`, and a fresh hash otherwise. Re-running provisioning with the
/// same secret therefore leaves the document unchanged.
pub fn verify_or_rehash(
    hasher: &dyn SecretHasher,
    document: &SecurityDocument,
    username: &str,
    plaintext: &str,
) -> String {
    match document.credential(username) {
        Some(stored) if verify(plaintext, stored) => stored.to_owned(),
        _ => hasher.hash(plaintext),
    }
}

fn double_sha256(plaintext: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plaintext.as_bytes());
    let first: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
    Sha256::digest(first.as_slice()).into()
}
