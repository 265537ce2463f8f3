use anyhow::{Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

const SECRET_KEY_BYTES: usize = 12;
const RECOVERY_KEY_BYTES: usize = 32;
const ADMIN_KEY_BYTES: usize = 32;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Room join secret, hex encoded (24 chars).
pub fn generate_secret_key() -> String {
    hex::encode(random_bytes::<SECRET_KEY_BYTES>())
}

/// Participant recovery credential, URL-safe base64 without padding.
pub fn generate_recovery_key() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<RECOVERY_KEY_BYTES>())
}

pub fn generate_admin_key() -> String {
    hex::encode(random_bytes::<ADMIN_KEY_BYTES>())
}

/// Compare a presented key against the expected one.
///
/// Both sides are hashed first so the comparison time does not depend on
/// how many leading bytes of the presented key are correct.
pub fn keys_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Argon2id hash of the admin key, PHC string format.
pub fn hash_admin_key(key: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map_err(|e| anyhow!("Admin key hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_admin_key(key: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(key.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_keys_are_hex_and_unique() {
        let a = generate_secret_key();
        let b = generate_secret_key();
        assert_eq!(a.len(), SECRET_KEY_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn recovery_keys_are_url_safe() {
        let key = generate_recovery_key();
        assert_eq!(key.len(), 43);
        assert!(!key.contains('+') && !key.contains('/') && !key.contains('='));
    }

    #[test]
    fn keys_match_is_exact() {
        let key = generate_secret_key();
        assert!(keys_match(&key, &key));
        assert!(!keys_match(&key[..key.len() - 1], &key));
        assert!(!keys_match("", &key));
    }

    #[test]
    fn admin_key_hash_verifies() {
        let key = generate_admin_key();
        let hash = hash_admin_key(&key).unwrap();
        assert!(verify_admin_key(&key, &hash));
        assert!(!verify_admin_key("not-the-key", &hash));
        assert!(!verify_admin_key(&key, "garbage"));
    }
}
