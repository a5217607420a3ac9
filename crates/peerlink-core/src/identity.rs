//! Wallet identity and message signatures
//!
//! Participants are identified by a blockchain-style account address. A
//! signature is a 65-byte recoverable secp256k1 signature over the
//! personal-message hash of the payload, so verification never needs the
//! signer's public key: the key is recovered from the signature and hashed
//! back into an address that is compared against the claimed sender.

use async_trait::async_trait;
use core::fmt;
use core::str::FromStr;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message as DigestMessage, PublicKey as SecpPublicKey, SecretKey, SECP256K1,
};
use sha3::{Digest, Keccak256};
use std::sync::Arc;

use crate::errors::CryptographicError;
use crate::types::Address;

/// Length of a recoverable signature in bytes (r, s, v)
pub const SIGNATURE_LEN: usize = 65;

// ----------------------------------------------------------------------------
// Signature
// ----------------------------------------------------------------------------

/// Recoverable signature, rendered as `0x`-prefixed hex on the wire
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Signature {
    type Err = CryptographicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        hex::decode(clean)
            .map(Self)
            .map_err(|_| CryptographicError::InvalidKeyFormat)
    }
}

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Personal-message digest: the payload prefixed with its length before hashing
pub fn hash_message(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Account address for a secp256k1 public key
pub fn address_from_public_key(public: &SecpPublicKey) -> Address {
    let uncompressed = public.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    Address::new(format!("0x{}", hex::encode(&digest[12..])))
}

// ----------------------------------------------------------------------------
// Verification
// ----------------------------------------------------------------------------

/// Recover the address that produced `signature` over `message`
pub fn recover_address(message: &[u8], signature: &Signature) -> Option<Address> {
    let bytes = signature.as_bytes();
    if bytes.len() != SIGNATURE_LEN {
        return None;
    }

    let recovery = match bytes[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        _ => return None,
    };
    let recovery_id = RecoveryId::from_i32(i32::from(recovery)).ok()?;
    let recoverable = RecoverableSignature::from_compact(&bytes[..64], recovery_id).ok()?;
    let digest = DigestMessage::from_digest(hash_message(message));
    let public = SECP256K1.recover_ecdsa(&digest, &recoverable).ok()?;
    Some(address_from_public_key(&public))
}

/// Check that `signature` over `message` was produced by `claimed`.
///
/// Malformed signatures and recovery failures yield `false`; this never errors.
pub fn verify(message: &[u8], signature: &Signature, claimed: &Address) -> bool {
    match recover_address(message, signature) {
        Some(recovered) => recovered == *claimed,
        None => false,
    }
}

// ----------------------------------------------------------------------------
// Identity Provider
// ----------------------------------------------------------------------------

/// External signing identity (a wallet) bound to one address
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Address of the account that signs
    fn address(&self) -> Address;

    /// Produce a recoverable personal-message signature over `message`
    async fn sign(&self, message: &[u8]) -> Result<Signature, CryptographicError>;
}

/// Sign with the given identity, failing when none is present
pub async fn sign(
    message: &[u8],
    identity: Option<&dyn IdentityProvider>,
) -> Result<Signature, CryptographicError> {
    match identity {
        Some(identity) => identity.sign(message).await,
        None => Err(CryptographicError::SigningUnavailable),
    }
}

/// Shared handle to an identity provider
pub type SharedIdentity = Arc<dyn IdentityProvider>;

// ----------------------------------------------------------------------------
// Local Wallet
// ----------------------------------------------------------------------------

/// In-process wallet holding a secp256k1 secret key
pub struct LocalWallet {
    secret: SecretKey,
    address: Address,
}

impl LocalWallet {
    /// Create a wallet with a freshly generated key
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::new(&mut secp256k1::rand::thread_rng()))
    }

    /// Load a wallet from a 32-byte secret key
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptographicError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Ok(Self::from_secret_key(secret))
    }

    /// Load a wallet from a hex-encoded secret key, with or without `0x`
    pub fn from_secret_hex(value: &str) -> Result<Self, CryptographicError> {
        let clean = value.trim().strip_prefix("0x").unwrap_or(value.trim());
        let bytes = hex::decode(clean).map_err(|_| CryptographicError::InvalidKeyFormat)?;
        Self::from_secret_bytes(&bytes)
    }

    fn from_secret_key(secret: SecretKey) -> Self {
        let public = SecpPublicKey::from_secret_key(SECP256K1, &secret);
        Self {
            secret,
            address: address_from_public_key(&public),
        }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// Hex export of the secret key
    pub fn secret_hex(&self) -> String {
        format!("0x{}", hex::encode(self.secret.secret_bytes()))
    }

    /// Sign synchronously
    pub fn sign_message(&self, message: &[u8]) -> Signature {
        let digest = DigestMessage::from_digest(hash_message(message));
        let (recovery_id, compact) = SECP256K1
            .sign_ecdsa_recoverable(&digest, &self.secret)
            .serialize_compact();

        let mut bytes = Vec::with_capacity(SIGNATURE_LEN);
        bytes.extend_from_slice(&compact);
        bytes.push(27 + recovery_id.to_i32() as u8);
        Signature(bytes)
    }
}

impl fmt::Debug for LocalWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for LocalWallet {
    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature, CryptographicError> {
        Ok(self.sign_message(message))
    }
}
