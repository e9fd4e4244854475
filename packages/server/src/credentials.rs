//! Sealed task credentials.
//!
//! Task payloads carry the owner's API key sealed with AES-256-GCM under
//! a worker-side key. The sealed form is `base64(nonce || ciphertext)`;
//! the nonce is random per seal, so sealing the same key twice yields
//! different tokens.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const NONCE_LEN: usize = 12;

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build from a base64-encoded 32-byte key (`PAYLOAD_KEY`).
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .context("PAYLOAD_KEY is not valid base64")?;
        if bytes.len() != 32 {
            return Err(anyhow!(
                "PAYLOAD_KEY must decode to 32 bytes, got {}",
                bytes.len()
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a plaintext credential for transport in a task payload.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("failed to seal credential"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Open a sealed credential. Fails on truncation or tampering.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = BASE64
            .decode(sealed.trim())
            .context("sealed credential is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            return Err(anyhow!("sealed credential is truncated"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("failed to open credential"))?;

        String::from_utf8(plaintext).context("credential is not valid UTF-8")
    }
}
