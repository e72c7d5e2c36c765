//! Password generation and at-rest hashing.

use rand::rngs::OsRng;
use rand::TryRngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error_handling::types::SecretError;

/// ASCII letters, digits and punctuation: 94 symbols, no whitespace.
pub const ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

// Largest multiple of the alphabet size that fits in a byte. Bytes at or
// above it are discarded so every symbol stays equally likely.
const ACCEPT_BELOW: usize = 256 - (256 % ALPHABET.len());

/// Returns `length` symbols drawn uniformly from [`ALPHABET`] using the
/// operating system's secure randomness source.
pub fn generate_password(length: usize) -> Result<SecretString, SecretError> {
    generate_with(&mut OsRng, length)
}

pub(crate) fn generate_with<R: TryRngCore>(
    rng: &mut R,
    length: usize,
) -> Result<SecretString, SecretError> {
    if length == 0 {
        return Err(SecretError::InvalidLength(length));
    }

    let mut password = String::with_capacity(length);
    let mut buf = [0u8; 64];
    while password.len() < length {
        rng.try_fill_bytes(&mut buf)
            .map_err(|e| SecretError::EntropyUnavailable(e.to_string()))?;
        for &byte in buf.iter() {
            if password.len() == length {
                break;
            }
            let b = usize::from(byte);
            if b < ACCEPT_BELOW {
                password.push(char::from(ALPHABET[b % ALPHABET.len()]));
            }
        }
    }
    buf.fill(0);
    Ok(SecretString::new(password))
}

/// bcrypt hash of `password`, suitable for storing in the ledger.
pub fn hash_password(password: &SecretString, cost: u32) -> Result<String, SecretError> {
    bcrypt::hash(password.expose_secret(), cost)
        .map_err(|e| SecretError::HashingFailed(e.to_string()))
}

pub fn verify_password(password: &SecretString, hash: &str) -> Result<bool, SecretError> {
    bcrypt::verify(password.expose_secret(), hash)
        .map_err(|e| SecretError::HashingFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct BrokenRng;

    impl TryRngCore for BrokenRng {
        type Error = std::io::Error;

        fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
            Err(std::io::Error::other("getrandom unavailable"))
        }

        fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
            Err(std::io::Error::other("getrandom unavailable"))
        }

        fn try_fill_bytes(&mut self, _dst: &mut [u8]) -> Result<(), Self::Error> {
            Err(std::io::Error::other("getrandom unavailable"))
        }
    }

    #[test]
    fn test_alphabet_is_letters_digits_punctuation() {
        assert_eq!(ALPHABET.len(), 94);
        let unique: HashSet<u8> = ALPHABET.iter().copied().collect();
        assert_eq!(unique.len(), 94);
        assert!(ALPHABET.iter().all(|b| b.is_ascii_graphic()));
        assert_eq!(ACCEPT_BELOW, 188);
    }

    #[test]
    fn test_generates_requested_length_from_alphabet() {
        for length in [1, 8, 16, 72] {
            let password = generate_password(length).unwrap();
            let exposed = password.expose_secret();
            assert_eq!(exposed.len(), length);
            assert!(exposed.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_passwords_differ() {
        let a = generate_password(16).unwrap();
        let b = generate_password(16).unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            generate_password(0),
            Err(SecretError::InvalidLength(0))
        ));
    }

    #[test]
    fn test_entropy_failure_surfaces() {
        let err = generate_with(&mut BrokenRng, 16).unwrap_err();
        assert!(matches!(err, SecretError::EntropyUnavailable(_)));
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let password = generate_password(16).unwrap();
        let shown = format!("{:?}", password);
        assert!(!shown.contains(password.expose_secret().as_str()));
    }

    #[test]
    fn test_hash_verifies_only_the_same_password() {
        let password = SecretString::new("correct-horse".to_string());
        let hash = hash_password(&password, 4).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password(&password, &hash).unwrap());
        let other = SecretString::new("battery-staple".to_string());
        assert!(!verify_password(&other, &hash).unwrap());
    }
}
