use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Result, TransferError};
use crate::{KEY_SIZE, NONCE_SIZE};

/// HKDF info label binding derived keys to this protocol.
const SESSION_INFO: &[u8] = b"session";

/// Per-session cryptographic state.
///
/// Construction generates a fresh ephemeral X25519 key pair. After both
/// peers have exchanged raw public keys, `derive_session` performs the ECDH
/// exchange and turns the shared secret plus the human-communicated token
/// into a ChaCha20-Poly1305 session cipher. The ephemeral secret is consumed
/// by the derivation, so a context can only ever establish one session.
pub struct CryptoContext {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    cipher: Option<ChaCha20Poly1305>,
}

impl CryptoContext {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        CryptoContext {
            secret: Some(secret),
            public,
            cipher: None,
        }
    }

    /// Raw 32-byte public key encoding for transmission.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Derive the session key from the peer's public key and the shared token.
    ///
    /// The 32-byte session key is `HKDF-SHA256(salt = token, ikm = ECDH
    /// shared secret, info = "session")`. Both sides compute the same key, so
    /// a wrong token surfaces as an authentication failure on the first
    /// decrypted frame rather than here.
    ///
    /// Fails with `Crypto(Handshake)` if `peer_public` is not exactly 32
    /// bytes or the session was already derived; in every failure case the
    /// cipher is left unset.
    pub fn derive_session(&mut self, peer_public: &[u8], token: &str) -> Result<()> {
        let peer_bytes: [u8; KEY_SIZE] = peer_public.try_into().map_err(|_| {
            TransferError::CryptoHandshake(format!(
                "peer public key must be {} bytes, got {}",
                KEY_SIZE,
                peer_public.len()
            ))
        })?;

        let secret = self.secret.take().ok_or_else(|| {
            TransferError::CryptoHandshake("session key already derived".to_string())
        })?;

        let shared = secret.diffie_hellman(&PublicKey::from(peer_bytes));

        let hkdf = Hkdf::<Sha256>::new(Some(token.as_bytes()), shared.as_bytes());
        let mut session_key = [0u8; KEY_SIZE];
        hkdf.expand(SESSION_INFO, &mut session_key)
            .map_err(|_| TransferError::CryptoHandshake("HKDF expansion failed".to_string()))?;

        self.cipher = Some(ChaCha20Poly1305::new((&session_key).into()));
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a frame payload. Output length is input length + 16 (tag).
    pub fn encrypt(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| TransferError::CryptoHandshake("session key not established".to_string()))?;
        cipher
            .encrypt(&Nonce::from(*nonce), plaintext)
            .map_err(|_| TransferError::CryptoAuthFailed)
    }

    /// Decrypt a frame payload, verifying the authentication tag.
    ///
    /// Returns `Crypto(AuthFailed)` on tag mismatch; no plaintext is ever
    /// produced from a failed decryption.
    pub fn decrypt(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| TransferError::CryptoHandshake("session key not established".to_string()))?;
        cipher
            .decrypt(&Nonce::from(*nonce), ciphertext)
            .map_err(|_| TransferError::CryptoAuthFailed)
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex encoding of a digest or key.
pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parse a 64-character lowercase hex string into a 32-byte digest.
pub fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        if chunk[0].is_ascii_uppercase() || chunk[1].is_ascii_uppercase() {
            return None;
        }
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}
