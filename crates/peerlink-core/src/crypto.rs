//! Session key agreement and authenticated encryption
//!
//! Each connected session owns an ephemeral X25519 key pair. Two parties
//! derive the same 256-bit symmetric key from their own private half and the
//! other side's public half (Diffie-Hellman followed by HKDF-SHA256), then
//! exchange ChaCha20-Poly1305 ciphertexts under a fresh random 96-bit nonce.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as AeadNonce,
};
use core::fmt;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptographicError;

/// Length of the AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of public keys and derived symmetric keys in bytes
pub const KEY_LEN: usize = 32;

/// Domain separation for the HKDF expansion step
const SHARED_KEY_INFO: &[u8] = b"peerlink shared key v1";

// ----------------------------------------------------------------------------
// Key Types
// ----------------------------------------------------------------------------

/// Public half of a session key pair, shared through the key directory
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, CryptographicError> {
        let bytes = hex::decode(value.trim().trim_start_matches("0x"))
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Ok(Self(key))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptographicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

/// Ephemeral key pair generated for each connected session
pub struct SessionKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl SessionKeyPair {
    /// Generate a key pair from the operating system RNG
    pub fn generate() -> Result<Self, CryptographicError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptographicError::CryptoUnavailable)?;
        let pair = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        Ok(pair)
    }

    /// Rebuild a key pair from raw private key bytes
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Derive the symmetric key shared with `peer`
    pub fn derive_shared_key(&self, peer: &PublicKey) -> Result<SharedKey, CryptographicError> {
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(CryptographicError::KeyDerivationFailed);
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; KEY_LEN];
        hkdf.expand(SHARED_KEY_INFO, &mut key)
            .map_err(|_| CryptographicError::KeyDerivationFailed)?;
        Ok(SharedKey { key })
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Symmetric key derived from a key agreement, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    key: [u8; KEY_LEN],
}

impl SharedKey {
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

// ----------------------------------------------------------------------------
// Nonce
// ----------------------------------------------------------------------------

/// 96-bit AEAD nonce, freshly random for every encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Result<Self, CryptographicError> {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptographicError::CryptoUnavailable)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(value: &str) -> Result<Self, CryptographicError> {
        let bytes = BASE64
            .decode(value)
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        let nonce: [u8; NONCE_LEN] = bytes
            .try_into()
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        Ok(Self(nonce))
    }
}

// ----------------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------------

/// Produce a fresh ephemeral key pair
pub fn generate_key_pair() -> Result<SessionKeyPair, CryptographicError> {
    SessionKeyPair::generate()
}

/// Derive the key shared between a local private key and a peer public key
pub fn derive_shared_key(
    local: &SessionKeyPair,
    peer: &PublicKey,
) -> Result<SharedKey, CryptographicError> {
    local.derive_shared_key(peer)
}

/// Encrypt UTF-8 text, returning the ciphertext and the nonce it was sealed with
pub fn encrypt(plaintext: &str, key: &SharedKey) -> Result<(Vec<u8>, Nonce), CryptographicError> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.key)
        .map_err(|_| CryptographicError::EncryptionFailed)?;
    let nonce = Nonce::random()?;
    let ciphertext = cipher
        .encrypt(AeadNonce::from_slice(&nonce.0), plaintext.as_bytes())
        .map_err(|_| CryptographicError::EncryptionFailed)?;
    Ok((ciphertext, nonce))
}

/// Decrypt and authenticate a ciphertext back into UTF-8 text
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    key: &SharedKey,
) -> Result<String, CryptographicError> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.key)
        .map_err(|_| CryptographicError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(AeadNonce::from_slice(&nonce.0), ciphertext)
        .map_err(|_| CryptographicError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CryptographicError::DecryptionFailed)
}
