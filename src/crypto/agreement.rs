//! X25519 key agreement
//!
//! One keypair backs each half of a handshake: generated when a proposal is
//! made or answered, spent when the peer's public key arrives. The raw
//! X25519 output never leaves this module; it is expanded in place with
//! HKDF-SHA256 into the settled channel's symmetric key and topic, so
//! callers only ever see hex strings and finished key material.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};
use super::KEY_SIZE;
use crate::Topic;

/// HKDF info string binding derived keys to this protocol
const KDF_INFO: &[u8] = b"wc";

/// Decode a hex-encoded X25519 public key
pub(super) fn decode_public_key(hex_key: &str) -> CryptoResult<[u8; 32]> {
    hex::decode(hex_key)
        .map_err(|_| CryptoError::InvalidPublicKey)?
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)
}

/// An agreement keypair, held until its handshake resolves
///
/// The secret half is zeroized on drop; the public half, hex-encoded,
/// doubles as the keypair id and the participant identity on the wire.
#[derive(ZeroizeOnDrop)]
pub struct AgreementKeypair {
    secret: [u8; 32],
    #[zeroize(skip)]
    public_hex: String,
}

impl AgreementKeypair {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_hex = hex::encode(PublicKey::from(&secret).as_bytes());
        AgreementKeypair {
            secret: secret.to_bytes(),
            public_hex,
        }
    }

    /// The public half, hex-encoded
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Agree with a peer and derive the settled channel
    ///
    /// Runs X25519 against the hex-encoded peer key, then expands the
    /// shared secret with HKDF into two halves: the symmetric key, and the
    /// topic the keychain stores it under. Both sides of a handshake land
    /// on the same pair.
    pub fn derive_settled(&self, peer_public: &str) -> CryptoResult<([u8; KEY_SIZE], Topic)> {
        let peer = PublicKey::from(decode_public_key(peer_public)?);
        let shared = StaticSecret::from(self.secret).diffie_hellman(&peer);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; KEY_SIZE * 2];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        Ok((key, hex::encode(&okm[KEY_SIZE..])))
    }
}

impl std::fmt::Debug for AgreementKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementKeypair({}...)", &self.public_hex[..16])
    }
}
