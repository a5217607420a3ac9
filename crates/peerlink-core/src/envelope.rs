//! Wire formats
//!
//! Two JSON documents cross process boundaries:
//!
//! * [`MessageEnvelope`]: one chat message as delivered end to end, either
//!   over a data channel or through the fallback store. The sender signs the
//!   canonical form of every field except the signature itself.
//! * [`ChannelFrame`]: the unit written to a data channel. The connection
//!   manager signs `{kind, content, sender, timestamp}` and receivers drop any
//!   frame whose signature does not recover to the channel's peer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::{self, Nonce, SharedKey};
use crate::errors::{CryptographicError, PeerlinkError};
use crate::identity::{self, Signature};
use crate::types::{Address, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Signed, optionally encrypted message as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub sender: Address,
    pub receiver: Address,
    /// Plaintext, or base64 ciphertext when `encrypted` is set
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub signature: String,
    pub timestamp: Timestamp,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disappear_after_ms: Option<u64>,
    #[serde(default)]
    pub burn_after_reading: bool,
}

impl MessageEnvelope {
    /// Build an unsigned plaintext envelope
    pub fn plaintext(
        id: MessageId,
        sender: Address,
        receiver: Address,
        content: &str,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            sender,
            receiver,
            content: content.to_string(),
            nonce: None,
            signature: String::new(),
            timestamp,
            encrypted: false,
            disappear_after_ms: None,
            burn_after_reading: false,
        }
    }

    /// Build an unsigned envelope carrying `content` sealed under `key`
    pub fn sealed(
        id: MessageId,
        sender: Address,
        receiver: Address,
        content: &str,
        key: &SharedKey,
        timestamp: Timestamp,
    ) -> Result<Self, CryptographicError> {
        let (ciphertext, nonce) = crypto::encrypt(content, key)?;
        Ok(Self {
            content: BASE64.encode(ciphertext),
            nonce: Some(nonce.to_base64()),
            encrypted: true,
            ..Self::plaintext(id, sender, receiver, "", timestamp)
        })
    }

    /// Attach the disappearing-message policy
    pub fn with_policies(mut self, disappear_after_ms: Option<u64>, burn_after_reading: bool) -> Self {
        self.disappear_after_ms = disappear_after_ms;
        self.burn_after_reading = burn_after_reading;
        self
    }

    /// Canonical bytes covered by the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "id": self.id,
            "sender": self.sender,
            "receiver": self.receiver,
            "content": self.content,
            "nonce": self.nonce,
            "timestamp": self.timestamp,
            "encrypted": self.encrypted,
            "disappear_after_ms": self.disappear_after_ms,
            "burn_after_reading": self.burn_after_reading,
        })
        .to_string()
        .into_bytes()
    }

    pub fn set_signature(&mut self, signature: &Signature) {
        self.signature = signature.to_hex();
    }

    /// Whether the signature recovers to the claimed sender
    pub fn verify_signature(&self) -> bool {
        match self.signature.parse::<Signature>() {
            Ok(signature) => identity::verify(&self.signing_bytes(), &signature, &self.sender),
            Err(_) => false,
        }
    }

    /// Decoded ciphertext and nonce of an encrypted envelope
    pub fn ciphertext(&self) -> Result<(Vec<u8>, Nonce), CryptographicError> {
        let nonce = self
            .nonce
            .as_deref()
            .ok_or(CryptographicError::DecryptionFailed)
            .and_then(Nonce::from_base64)?;
        let ciphertext = BASE64
            .decode(&self.content)
            .map_err(|_| CryptographicError::DecryptionFailed)?;
        Ok((ciphertext, nonce))
    }

    /// Recover the plaintext, decrypting with `key` when the envelope is sealed
    pub fn open(&self, key: Option<&SharedKey>) -> Result<String, CryptographicError> {
        if !self.encrypted {
            return Ok(self.content.clone());
        }
        let key = key.ok_or(CryptographicError::DecryptionFailed)?;
        let (ciphertext, nonce) = self.ciphertext()?;
        crypto::decrypt(&ciphertext, &nonce, key)
    }

    pub fn to_json(&self) -> Result<String, PeerlinkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, PeerlinkError> {
        serde_json::from_str(raw)
            .map_err(|e| PeerlinkError::invalid_envelope(format!("malformed envelope: {e}")))
    }
}

// ----------------------------------------------------------------------------
// Channel Frame
// ----------------------------------------------------------------------------

/// What a channel frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// A serialized [`MessageEnvelope`]
    Message,
    /// Delivery acknowledgement; `content` is the acknowledged message id
    Receipt,
}

/// Signed frame written to a data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub kind: FrameKind,
    pub content: String,
    pub sender: Address,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub signature: String,
}

impl ChannelFrame {
    pub fn new(kind: FrameKind, content: String, sender: Address, timestamp: Timestamp) -> Self {
        Self {
            kind,
            content,
            sender,
            timestamp,
            signature: String::new(),
        }
    }

    /// Canonical bytes covered by the frame signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "kind": self.kind,
            "content": self.content,
            "sender": self.sender,
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    pub fn verify_signature(&self) -> bool {
        match self.signature.parse::<Signature>() {
            Ok(signature) => identity::verify(&self.signing_bytes(), &signature, &self.sender),
            Err(_) => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKeyPair;
    use crate::identity::LocalWallet;

    fn signed_envelope(wallet: &LocalWallet) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::plaintext(
            MessageId::new(),
            wallet.address(),
            Address::new("0xabc"),
            "hello",
            Timestamp::new(1_700_000_000_000),
        );
        let signature = wallet.sign_message(&envelope.signing_bytes());
        envelope.set_signature(&signature);
        envelope
    }

    #[test]
    fn test_envelope_signature_covers_content() {
        let wallet = LocalWallet::generate();
        let envelope = signed_envelope(&wallet);
        assert!(envelope.verify_signature());

        let mut tampered = envelope.clone();
        tampered.content = "goodbye".into();
        assert!(!tampered.verify_signature());

        let mut extended = envelope;
        extended.disappear_after_ms = Some(1);
        assert!(!extended.verify_signature());
    }

    #[test]
    fn test_unsigned_envelope_fails_verification() {
        let envelope = MessageEnvelope::plaintext(
            MessageId::new(),
            Address::new("0xa"),
            Address::new("0xb"),
            "x",
            Timestamp::new(0),
        );
        assert!(!envelope.verify_signature());
    }

    #[test]
    fn test_sealed_envelope_opens_with_peer_key() {
        let alice = SessionKeyPair::generate().unwrap();
        let bob = SessionKeyPair::generate().unwrap();
        let alice_key = alice.derive_shared_key(&bob.public_key()).unwrap();
        let bob_key = bob.derive_shared_key(&alice.public_key()).unwrap();

        let envelope = MessageEnvelope::sealed(
            MessageId::new(),
            Address::new("0xa"),
            Address::new("0xb"),
            "top secret",
            &alice_key,
            Timestamp::new(10),
        )
        .unwrap();

        assert!(envelope.encrypted);
        assert_ne!(envelope.content, "top secret");
        assert_eq!(envelope.open(Some(&bob_key)).unwrap(), "top secret");
        assert_eq!(envelope.open(None), Err(CryptographicError::DecryptionFailed));
    }

    #[test]
    fn test_envelope_json_shape() {
        let wallet = LocalWallet::generate();
        let envelope = signed_envelope(&wallet).with_policies(Some(60_000), true);
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["receiver"], "0xabc");
        assert_eq!(value["encrypted"], false);
        assert_eq!(value["disappear_after_ms"], 60_000);
        assert!(value.get("nonce").is_none());
        assert!(MessageEnvelope::from_json("{not json").is_err());
    }

    #[test]
    fn test_frame_signature() {
        let wallet = LocalWallet::generate();
        let mut frame = ChannelFrame::new(
            FrameKind::Receipt,
            MessageId::new().to_string(),
            wallet.address(),
            Timestamp::new(42),
        );
        frame.signature = wallet.sign_message(&frame.signing_bytes()).to_hex();

        let decoded = ChannelFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert!(decoded.verify_signature());

        let mut spoofed = decoded;
        spoofed.sender = LocalWallet::generate().address();
        assert!(!spoofed.verify_signature());
    }
}
