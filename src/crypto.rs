//! Cryptographic primitives: ECDSA keys for transaction signing and the
//! key agreement plus frame cipher used by the peer link.

use crate::capabilities::SignatureVerifier;
use crate::error::ChainError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE},
    ecdh::SharedSecret,
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};
use std::fmt;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Prefix of both handshake messages.
pub const HANDSHAKE_MAGIC: &[u8; 4] = b"KEM1";
pub const HANDSHAKE_LEN: usize = HANDSHAKE_MAGIC.len() + PUBLIC_KEY_SIZE;

const NETWORK_KEY_DOMAIN: &[u8] = b"kemchain-network-key";
const INITIATOR_TO_RESPONDER: &[u8] = b"kemchain-link-i2r";
const RESPONDER_TO_INITIATOR: &[u8] = b"kemchain-link-r2i";

fn message_digest(message: &[u8]) -> Message {
    Message::from_digest(Sha256::digest(message).into())
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Hex of the compressed public key; the address form understood by
    /// [`Secp256k1Verifier`].
    pub fn address(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Signs the SHA-256 digest of `message` and returns the compact signature.
    pub fn sign(&self, message: &[u8]) -> [u8; COMPACT_SIGNATURE_SIZE] {
        SECP256K1_CONTEXT
            .sign_ecdsa(&message_digest(message), &self.secret_key)
            .serialize_compact()
    }
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message_digest(message), &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Senders are hex-encoded compressed public keys; signatures are compact
/// ECDSA over the SHA-256 of the signable message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl SignatureVerifier for Secp256k1Verifier {
    fn verify(&self, signer: &str, message: &[u8], signature: &[u8]) -> bool {
        match hex::decode(signer) {
            Ok(public_key) => verify_signature(&public_key, message, signature).is_ok(),
            Err(_) => false,
        }
    }
}

/// Pre-shared secret all peers of one network hold. It authenticates the
/// link: a peer with a different key fails on its first frame.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey([u8; 32]);

impl NetworkKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NETWORK_KEY_DOMAIN);
        hasher.update(passphrase.as_bytes());
        NetworkKey(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

/// One-connection key for the handshake.
pub struct EphemeralKey {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut OsRng);
        let public = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.serialize()
    }

    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; 32], ChainError> {
        let peer = PublicKey::from_slice(peer_public)
            .map_err(|e| ChainError::CryptoError(format!("Invalid peer key: {}", e)))?;
        Ok(SharedSecret::new(&peer, &self.secret).secret_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

pub struct SessionKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

fn direction_key(
    label: &[u8],
    shared: &[u8; 32],
    network_key: &NetworkKey,
    initiator_public: &[u8],
    responder_public: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared);
    hasher.update(network_key.as_bytes());
    hasher.update(initiator_public);
    hasher.update(responder_public);
    hasher.finalize().into()
}

/// Per-direction keys, bound to the network key and both handshake keys.
pub fn derive_session_keys(
    shared: &[u8; 32],
    network_key: &NetworkKey,
    initiator_public: &[u8],
    responder_public: &[u8],
    role: Role,
) -> SessionKeys {
    let i2r = direction_key(
        INITIATOR_TO_RESPONDER,
        shared,
        network_key,
        initiator_public,
        responder_public,
    );
    let r2i = direction_key(
        RESPONDER_TO_INITIATOR,
        shared,
        network_key,
        initiator_public,
        responder_public,
    );
    match role {
        Role::Initiator => SessionKeys { send: i2r, recv: r2i },
        Role::Responder => SessionKeys { send: r2i, recv: i2r },
    }
}

/// AES-256-GCM with a counter nonce. Frames must be opened in the order they
/// were sealed; a dropped, replayed or reordered frame fails authentication.
pub struct FrameCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: &[u8; 32]) -> Result<Self, ChainError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ChainError::CryptoError(format!("Invalid frame key: {}", e)))?;
        Ok(Self { cipher, counter: 0 })
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], ChainError> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ChainError::CryptoError("Frame counter exhausted".to_string()))?;
        Ok(nonce)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChainError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ChainError::CryptoError("Frame encryption failed".to_string()))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChainError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| ChainError::CryptoError("Frame authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(
        initiator_key: &NetworkKey,
        responder_key: &NetworkKey,
    ) -> (SessionKeys, SessionKeys) {
        let initiator = EphemeralKey::generate();
        let responder = EphemeralKey::generate();
        let i_pub = initiator.public_bytes();
        let r_pub = responder.public_bytes();

        let i_shared = initiator.shared_secret(&r_pub).unwrap();
        let r_shared = responder.shared_secret(&i_pub).unwrap();
        assert_eq!(i_shared, r_shared);

        (
            derive_session_keys(&i_shared, initiator_key, &i_pub, &r_pub, Role::Initiator),
            derive_session_keys(&r_shared, responder_key, &i_pub, &r_pub, Role::Responder),
        )
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"hello");
        assert!(verify_signature(&keypair.public_key_bytes(), b"hello", &signature).is_ok());
        assert!(verify_signature(&keypair.public_key_bytes(), b"hellO", &signature).is_err());
        assert!(verify_signature(&keypair.public_key_bytes(), b"hello", &signature[..10]).is_err());

        let verifier = Secp256k1Verifier;
        assert!(verifier.verify(&keypair.address(), b"hello", &signature));
        assert!(!verifier.verify("not-hex", b"hello", &signature));
        assert!(!verifier.verify(&KeyPair::generate().address(), b"hello", &signature));
    }

    #[test]
    fn test_session_keys_pair_up() {
        let key = NetworkKey::from_passphrase("testnet");
        let (initiator, responder) = session(&key, &key);
        assert_eq!(initiator.send, responder.recv);
        assert_eq!(initiator.recv, responder.send);
        assert_ne!(initiator.send, initiator.recv);
    }

    #[test]
    fn test_frames_round_trip_in_order() {
        let key = NetworkKey::from_passphrase("testnet");
        let (initiator, responder) = session(&key, &key);
        let mut sealer = FrameCipher::new(&initiator.send).unwrap();
        let mut opener = FrameCipher::new(&responder.recv).unwrap();

        let first = sealer.seal(b"first").unwrap();
        let second = sealer.seal(b"second").unwrap();
        assert_eq!(opener.open(&first).unwrap(), b"first");
        assert_eq!(opener.open(&second).unwrap(), b"second");
    }

    #[test]
    fn test_reordered_frame_is_rejected() {
        let key = NetworkKey::from_passphrase("testnet");
        let (initiator, responder) = session(&key, &key);
        let mut sealer = FrameCipher::new(&initiator.send).unwrap();
        let mut opener = FrameCipher::new(&responder.recv).unwrap();

        let _first = sealer.seal(b"first").unwrap();
        let second = sealer.seal(b"second").unwrap();
        assert!(opener.open(&second).is_err());
    }

    #[test]
    fn test_network_key_mismatch_fails() {
        let (initiator, responder) = session(
            &NetworkKey::from_passphrase("mainnet"),
            &NetworkKey::from_passphrase("testnet"),
        );
        let mut sealer = FrameCipher::new(&initiator.send).unwrap();
        let mut opener = FrameCipher::new(&responder.recv).unwrap();
        let frame = sealer.seal(b"hello").unwrap();
        assert!(opener.open(&frame).is_err());
    }

    #[test]
    fn test_network_key_debug_is_redacted() {
        let key = NetworkKey::from_passphrase("secret");
        assert_eq!(format!("{:?}", key), "NetworkKey(..)");
    }
}
