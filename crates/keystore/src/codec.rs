//! Obfuscation codec for the secrets file
//!
//! Derives a 256-bit key with PBKDF2-HMAC-SHA256 from a machine-specific seed
//! and seals payloads with ChaCha20-Poly1305 under a fresh random nonce per
//! write. The Poly1305 tag doubles as a corruption check: a truncated or
//! edited file fails to open instead of decrypting to garbage.
//!
//! Anyone who can read the seed sources on this machine can rebuild the key.
//! Treat this as protection against casual disclosure only.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use common::Secret;
use rand::RngExt;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::document::{ENVELOPE_VERSION, Envelope};
use crate::error::{Error, Result};

/// PBKDF2 rounds used when the configuration does not override them.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Cipher identifier written into every envelope.
pub const CIPHER_NAME: &str = "chacha20poly1305";

const KDF_SALT: &[u8] = b"keypool/secrets-file/v1";
const NONCE_LEN: usize = 12;

/// Symmetric codec keyed by a derived secret.
pub struct Codec {
    key: Secret<[u8; 32]>,
}

impl Codec {
    /// Derive the codec key from `seed` with `iterations` PBKDF2 rounds.
    ///
    /// Deterministic: the same seed and iteration count always produce the
    /// same key, which is what lets a restart decrypt the previous file.
    pub fn derive(seed: &[u8], iterations: u32) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(seed, KDF_SALT, iterations, &mut key);
        let codec = Self {
            key: Secret::new(key),
        };
        key.zeroize();
        codec
    }

    /// Encrypt `plaintext` into a versioned envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Codec("encryption failed".into()))?;

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            cipher: CIPHER_NAME.to_string(),
            nonce: STANDARD.encode(nonce),
            payload: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt an envelope produced by [`Codec::seal`].
    ///
    /// Fails on an unknown cipher, malformed base64, a wrong key (different
    /// machine) or any modification of the ciphertext.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.cipher != CIPHER_NAME {
            return Err(Error::Codec(format!(
                "unsupported cipher {:?}",
                envelope.cipher
            )));
        }

        let nonce = STANDARD
            .decode(&envelope.nonce)
            .map_err(|e| Error::Codec(format!("decoding nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Codec(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&envelope.payload)
            .map_err(|e| Error::Codec(format!("decoding payload: {e}")))?;

        self.cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                Error::Codec("decryption failed (wrong machine or modified file)".into())
            })
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.expose()))
    }
}
