use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use sha2::{Digest, Sha256};

use crate::error::{crypto_error, EntglResult};

const HKDF_SALT: &[u8] = b"entgldb/session-keys/v1";
const NONCE_LEN: usize = 12;

/// Which end of the connection this node is; decides which derived key seals
/// and which opens, so the two directions never share a nonce stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// SHA-256 of the shared cluster token, exchanged in `Hello` frames.
pub fn hash_auth_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Constant-time comparison of auth token hashes.
pub fn auth_hashes_match(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Ephemeral P-256 key pair for one handshake.
pub struct EphemeralKey {
    secret: EphemeralSecret,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        Self {
            secret: EphemeralSecret::random(&mut rand::rngs::OsRng),
        }
    }

    /// SEC1-encoded public half, sent in the `KeyExchange` frame.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.secret.public_key().to_sec1_bytes().to_vec()
    }

    /// Completes ECDH against the peer's public key and splits the shared
    /// secret into one AES-256 key per direction via HKDF-SHA-256.
    pub fn derive_session(self, peer_public: &[u8], role: SessionRole) -> EntglResult<SessionCrypto> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|err| crypto_error(format!("invalid peer public key: {err}")))?;
        let shared = self.secret.diffie_hellman(&peer);

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.raw_secret_bytes());
        let mut initiator_to_responder = [0u8; 32];
        let mut responder_to_initiator = [0u8; 32];
        hkdf.expand(b"initiator->responder", &mut initiator_to_responder)
            .map_err(|_| crypto_error("session key expansion failed"))?;
        hkdf.expand(b"responder->initiator", &mut responder_to_initiator)
            .map_err(|_| crypto_error("session key expansion failed"))?;

        let (seal_key, open_key) = match role {
            SessionRole::Initiator => (initiator_to_responder, responder_to_initiator),
            SessionRole::Responder => (responder_to_initiator, initiator_to_responder),
        };
        Ok(SessionCrypto {
            seal: CipherState::new(&seal_key),
            open: CipherState::new(&open_key),
        })
    }
}

/// One AEAD direction: a key plus a counter-driven nonce that never repeats.
pub struct CipherState {
    cipher: Aes256Gcm,
    nonce_counter: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter = self
            .nonce_counter
            .checked_add(1)
            .expect("nonce counter exhausted");
        nonce
    }

    /// Encrypts `plaintext`; the GCM tag is appended to the ciphertext.
    pub fn seal(&mut self, plaintext: &[u8]) -> EntglResult<(Vec<u8>, Vec<u8>)> {
        let nonce = self.next_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
            .map_err(|_| crypto_error("encryption failed"))?;
        Ok((ciphertext, nonce.to_vec()))
    }

    /// Decrypts and authenticates; any tag failure is a `CRYPTO_ERROR`.
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8]) -> EntglResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(crypto_error("envelope nonce has the wrong length"));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload::from(ciphertext))
            .map_err(|_| crypto_error("authentication tag verification failed"))
    }
}

/// Established session keys, one cipher state per direction.
pub struct SessionCrypto {
    pub seal: CipherState,
    pub open: CipherState,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto").finish_non_exhaustive()
    }
}
