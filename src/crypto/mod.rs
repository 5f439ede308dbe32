//! Crypto controller
//!
//! Everything the protocol needs from cryptography, behind one controller:
//! - `agreement`: X25519 keypairs and settled-channel derivation
//! - `keychain`: persisted topic → symmetric key table
//! - the hex AEAD envelope every payload travels in, built right here
//!
//! Payloads are sealed with ChaCha20-Poly1305 under the topic key and move
//! on the wire as hex-encoded `nonce || ciphertext || tag`.

pub mod agreement;
pub mod error;
pub mod keychain;

// Re-export commonly used types
pub use agreement::AgreementKeypair;
pub use error::{CryptoError, CryptoResult};
pub use keychain::Keychain;

use std::collections::HashMap;
use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::Topic;

/// Size of a symmetric key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the envelope nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Seal `plaintext` under `key` into a hex `nonce || ciphertext || tag`
/// envelope, with a fresh random nonce
fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> String {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = random_bytes::<NONCE_SIZE>();
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("aead sealing cannot fail with a valid key");

    let mut envelope = Vec::with_capacity(NONCE_SIZE + sealed.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&sealed);
    hex::encode(envelope)
}

/// Open a hex envelope under `key`; tag mismatch, truncation and bad hex
/// all fail the same way so the wire leaks nothing about which it was
fn open(key: &[u8; KEY_SIZE], envelope: &str) -> CryptoResult<Vec<u8>> {
    let data = hex::decode(envelope).map_err(|_| CryptoError::InvalidEncoding)?;
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, sealed) = data.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Crypto controller
///
/// Owns the keychain and the in-flight agreement keypairs. Every payload
/// the engines emit through the relayer is sealed or opened here.
pub struct Crypto {
    keychain: Keychain,
    keypairs: RwLock<HashMap<String, AgreementKeypair>>,
}

impl Crypto {
    /// Create a controller backed by `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Crypto {
            keychain: Keychain::new(storage),
            keypairs: RwLock::new(HashMap::new()),
        }
    }

    /// Restore the persisted keychain
    pub async fn init(&self) -> Result<()> {
        self.keychain.init().await?;
        Ok(())
    }

    /// Generate and store a fresh X25519 keypair
    ///
    /// Returns the public key hex, which doubles as the keypair id.
    pub async fn generate_keypair(&self) -> String {
        let keypair = AgreementKeypair::generate();
        let id = keypair.public_key_hex().to_string();
        self.keypairs.write().await.insert(id.clone(), keypair);
        id
    }

    /// Derive and store the symmetric key shared with `peer_public`
    ///
    /// Spends the keypair stored under `self_id`: agrees with the peer,
    /// expands the secret into the symmetric key and the settled topic, and
    /// stores the key in the keychain at that topic (or at `override_topic`
    /// when supplied). Returns the topic.
    pub async fn generate_shared_key(
        &self,
        self_id: &str,
        peer_public: &str,
        override_topic: Option<Topic>,
    ) -> Result<Topic> {
        let keypair = self
            .keypairs
            .write()
            .await
            .remove(self_id)
            .ok_or_else(|| CryptoError::KeyPairNotFound {
                id: self_id.to_string(),
            })?;

        let (key, derived_topic) = keypair.derive_settled(peer_public)?;
        let topic = override_topic.unwrap_or(derived_topic);

        self.keychain.set(&topic, key).await?;
        Ok(topic)
    }

    /// Whether a symmetric key is stored at `topic`
    pub async fn has_keys(&self, topic: &str) -> bool {
        self.keychain.has(topic).await
    }

    /// Read the symmetric key at `topic`
    pub async fn symmetric_key(&self, topic: &str) -> Result<[u8; KEY_SIZE]> {
        Ok(self.keychain.get(topic).await?)
    }

    /// Encrypt a UTF-8 payload under the topic key
    ///
    /// Output is `nonce || ciphertext || tag`, hex-encoded.
    pub async fn encrypt(&self, topic: &str, plaintext: &str) -> Result<String> {
        let key = self.keychain.get(topic).await?;
        Ok(seal(&key, plaintext.as_bytes()))
    }

    /// Decrypt a hex envelope under the topic key
    pub async fn decrypt(&self, topic: &str, message: &str) -> Result<String> {
        let key = self.keychain.get(topic).await?;
        let plaintext = open(&key, message)?;
        String::from_utf8(plaintext).map_err(|_| Error::Crypto(CryptoError::DecryptionFailed))
    }

    /// Remove the symmetric key at `topic`
    pub async fn delete_keys(&self, topic: &str) -> Result<()> {
        self.keychain.delete(topic).await?;
        Ok(())
    }

    /// Derive a proposal topic from a hex-encoded participant public key
    pub fn proposal_topic(public_key: &str) -> CryptoResult<Topic> {
        let bytes = agreement::decode_public_key(public_key)?;
        Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
    }
}
