//! SSH key pair generation for locally sourced public keys.
//!
//! Produces an RSA key pair in the encodings the authority expects:
//!
//! - public key as a single `authorized_keys` line with the key id as comment,
//! - private key as an OpenSSH private key block with `\n` line endings,
//!   encrypted (`aes256-ctr` + `bcrypt-pbkdf`) when a passphrase is given.
//!
//! Generation is CPU-bound and has no side effects; callers running inside an
//! async runtime should move it to a blocking thread.

use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{HashAlg, LineEnding, PrivateKey};
use sshcert_core::KeyMaterial;
use tracing::debug;

/// Key size used when the caller does not request a positive one.
pub const DEFAULT_KEY_SIZE: usize = 3072;

/// Smallest RSA modulus accepted.
pub const MIN_KEY_SIZE: usize = 2048;

/// Largest RSA modulus accepted.
pub const MAX_KEY_SIZE: usize = 16384;

#[derive(thiserror::Error, Debug)]
pub enum KeyGenError {
    #[error("invalid key size {0} bits (supported: 2048..=16384)")]
    InvalidSize(usize),
    #[error("RSA key generation failed: {0}")]
    Generate(#[source] ssh_key::Error),
    #[error("private key encryption failed: {0}")]
    Encrypt(#[source] ssh_key::Error),
    #[error("key encoding failed: {0}")]
    Encode(#[source] ssh_key::Error),
}

/// Source of fresh SSH key pairs.
pub trait KeyGenerator: Send + Sync {
    /// Generate a key pair of `size_bits`.
    ///
    /// `size_bits` must already be resolved (see [`resolve_key_size`]).
    /// A `None` or empty passphrase leaves the private key unencrypted.
    fn generate(
        &self,
        size_bits: usize,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<KeyMaterial, KeyGenError>;
}

/// [`KeyGenerator`] backed by `ssh-key` and the OS random number generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeyGenerator;

impl KeyGenerator for SshKeyGenerator {
    fn generate(
        &self,
        size_bits: usize,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<KeyMaterial, KeyGenError> {
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&size_bits) {
            return Err(KeyGenError::InvalidSize(size_bits));
        }

        let keypair = RsaKeypair::random(&mut OsRng, size_bits).map_err(KeyGenError::Generate)?;
        let mut private_key =
            PrivateKey::new(KeypairData::from(keypair), comment).map_err(KeyGenError::Generate)?;

        let public_key = private_key
            .public_key()
            .to_openssh()
            .map_err(KeyGenError::Encode)?;
        let fingerprint = private_key.public_key().fingerprint(HashAlg::Sha256);

        let encrypted = match passphrase.filter(|p| !p.is_empty()) {
            Some(p) => {
                private_key = private_key
                    .encrypt(&mut OsRng, p)
                    .map_err(KeyGenError::Encrypt)?;
                true
            }
            None => false,
        };

        let pem = private_key
            .to_openssh(LineEnding::LF)
            .map_err(KeyGenError::Encode)?;

        debug!(size_bits, %fingerprint, encrypted, "generated SSH key pair");

        Ok(KeyMaterial {
            private_key: pem,
            public_key,
        })
    }
}

/// Resolve a caller-requested key size.  Anything `<= 0` (or absent) becomes
/// [`DEFAULT_KEY_SIZE`]; positive values pass through unchanged.
pub fn resolve_key_size(requested: Option<i64>) -> usize {
    match requested {
        Some(bits) if bits > 0 => usize::try_from(bits).unwrap_or(usize::MAX),
        _ => DEFAULT_KEY_SIZE,
    }
}

/// Convert CRLF line endings to LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}
