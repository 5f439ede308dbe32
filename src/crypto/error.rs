//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The payload is not valid hex
    #[error("Invalid payload encoding")]
    InvalidEncoding,

    /// Decryption failed - authentication tag mismatch (possibly tampered data)
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// No symmetric key is stored for the topic
    #[error("No key found for topic: {topic}")]
    KeyNotFound {
        /// The topic whose key was looked up
        topic: String,
    },

    /// No keypair is stored under the id
    #[error("No keypair found for id: {id}")]
    KeyPairNotFound {
        /// The keypair id (public key hex)
        id: String,
    },

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
