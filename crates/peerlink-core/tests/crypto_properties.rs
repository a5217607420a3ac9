//! Property tests for the cryptographic primitives

use peerlink_core::{
    decrypt, derive_shared_key, encrypt, identity, Address, CryptographicError, LocalWallet,
    SessionKeyPair, Signature,
};
use proptest::prelude::*;

fn key_pair_strategy() -> impl Strategy<Value = SessionKeyPair> {
    any::<[u8; 32]>().prop_map(SessionKeyPair::from_secret_bytes)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encrypt_decrypt_round_trip(
        alice in key_pair_strategy(),
        bob in key_pair_strategy(),
        text in ".*",
    ) {
        let sender_key = derive_shared_key(&alice, &bob.public_key()).unwrap();
        let receiver_key = derive_shared_key(&bob, &alice.public_key()).unwrap();

        let (ciphertext, nonce) = encrypt(&text, &sender_key).unwrap();
        prop_assert_eq!(decrypt(&ciphertext, &nonce, &receiver_key).unwrap(), text);
    }

    #[test]
    fn prop_any_bit_flip_is_rejected(
        pair in key_pair_strategy(),
        peer in key_pair_strategy(),
        text in ".{1,64}",
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = derive_shared_key(&pair, &peer.public_key()).unwrap();
        let (mut ciphertext, nonce) = encrypt(&text, &key).unwrap();
        let position = index.index(ciphertext.len());
        ciphertext[position] ^= 1 << bit;

        prop_assert_eq!(
            decrypt(&ciphertext, &nonce, &key),
            Err(CryptographicError::DecryptionFailed)
        );
    }

    #[test]
    fn prop_signature_binds_message(message in prop::collection::vec(any::<u8>(), 0..256)) {
        let wallet = LocalWallet::generate();
        let signature = wallet.sign_message(&message);
        prop_assert!(identity::verify(&message, &signature, &wallet.address()));

        let mut altered = message.clone();
        altered.push(0);
        prop_assert!(!identity::verify(&altered, &signature, &wallet.address()));
    }
}

#[test]
fn test_signature_from_other_wallet_never_verifies() {
    let signer = LocalWallet::generate();
    let claimed: Address = LocalWallet::generate().address();
    let signature: Signature = signer.sign_message(b"payload");
    assert!(!identity::verify(b"payload", &signature, &claimed));
    assert!(identity::verify(b"payload", &signature, &signer.address()));
}
