// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Encryption-at-rest capability for refresh secrets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

/// Seals and opens short secrets. `aad` binds the ciphertext to its storage
/// namespace, so a sealed value copied under another principal fails to open.
pub trait Sealer: Send + Sync + 'static {
    fn seal(&self, plaintext: &str, aad: &str) -> anyhow::Result<String>;
    fn open(&self, sealed: &str, aad: &str) -> anyhow::Result<String>;
}

/// AES-256-GCM with a random 96-bit nonce per value.
///
/// Sealed form: `base64(nonce || ciphertext || tag)`.
pub struct AeadSealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

pub const KEY_LEN: usize = 32;

impl AeadSealer {
    pub fn new(key: &[u8; KEY_LEN]) -> anyhow::Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| anyhow::anyhow!("invalid AES-256-GCM key"))?;
        Ok(Self { key: LessSafeKey::new(unbound), rng: SystemRandom::new() })
    }

    /// Parse a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("store key is not valid base64: {e}"))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("store key must be {KEY_LEN} bytes, got {}", b.len()))?;
        Self::new(&key)
    }

    /// Generate a fresh random key, returned base64-encoded.
    pub fn generate_key() -> anyhow::Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| anyhow::anyhow!("system RNG unavailable"))?;
        Ok(STANDARD.encode(key))
    }
}

impl std::fmt::Debug for AeadSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadSealer").finish_non_exhaustive()
    }
}

impl Sealer for AeadSealer {
    fn seal(&self, plaintext: &str, aad: &str) -> anyhow::Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| anyhow::anyhow!("system RNG unavailable"))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| anyhow::anyhow!("seal failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    fn open(&self, sealed: &str, aad: &str) -> anyhow::Result<String> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|e| anyhow::anyhow!("sealed value is not base64: {e}"))?;
        if raw.len() < NONCE_LEN {
            anyhow::bail!("sealed value too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] =
            nonce.try_into().map_err(|_| anyhow::anyhow!("bad nonce length"))?;

        let mut buf = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad.as_bytes()), &mut buf)
            .map_err(|_| anyhow::anyhow!("sealed value failed authentication"))?;
        String::from_utf8(plain.to_vec()).map_err(|e| anyhow::anyhow!("sealed value not UTF-8: {e}"))
    }
}
