
use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{Aes128Gcm, KeyInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// HKDF salt for deriving the per-frame AES-GCM encryption key from key
/// material. Part of the interoperability contract; must match peer
/// implementations bit for bit.
pub const ENCRYPTION_KEY_SALT: &[u8] = b"JFrameEncryptionKey";
/// HKDF salt for ratcheting key material forward. Same contract.
pub const RATCHET_SALT: &[u8] = b"JFrameRatchetKey";

/// Length of raw key material in bytes.
pub const KEY_MATERIAL_LEN: usize = 32;
/// Length of the derived AES-128-GCM key in bytes.
pub(crate) const ENCRYPTION_KEY_LEN: usize = 16;

/// KeyMaterial is the 256-bit secret a participant distributes over the
/// secure signaling channel. It is only ever used as HKDF input and is wiped
/// from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_MATERIAL_LEN]);

impl KeyMaterial {
    /// new wraps raw key material, copying it. Callers should drop their own
    /// copy of the bytes once wrapped.
    pub fn new(raw: &[u8]) -> Result<KeyMaterial> {
        if raw.len() != KEY_MATERIAL_LEN {
            return Err(Error::KeyMaterialLength(KEY_MATERIAL_LEN, raw.len()));
        }
        let mut material = [0u8; KEY_MATERIAL_LEN];
        material.copy_from_slice(raw);
        Ok(KeyMaterial(material))
    }

    /// generate returns fresh key material from the system CSPRNG.
    pub fn generate() -> KeyMaterial {
        let mut material = [0u8; KEY_MATERIAL_LEN];
        OsRng.fill_bytes(&mut material);
        KeyMaterial(material)
    }

    /// derive_encryption_key derives the AES-128-GCM key that encrypts frames
    /// under this material.
    pub(crate) fn derive_encryption_key(&self) -> Result<Aes128Gcm> {
        let key = self.derive_encryption_key_bytes()?;
        Ok(Aes128Gcm::new(GenericArray::from_slice(&key)))
    }

    pub(crate) fn derive_encryption_key_bytes(&self) -> Result<[u8; ENCRYPTION_KEY_LEN]> {
        let hkdf = Hkdf::<Sha256>::new(Some(ENCRYPTION_KEY_SALT), &self.0);
        let mut okm = [0u8; ENCRYPTION_KEY_LEN];
        hkdf.expand(&[], &mut okm)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(okm)
    }

    /// ratchet derives the next material in the forward chain. The chain is
    /// one-way: this material cannot be recovered from the result.
    pub fn ratchet(&self) -> Result<KeyMaterial> {
        let hkdf = Hkdf::<Sha256>::new(Some(RATCHET_SALT), &self.0);
        let mut okm = [0u8; KEY_MATERIAL_LEN];
        hkdf.expand(&[], &mut okm)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(KeyMaterial(okm))
    }

    /// expose returns the raw bytes. The single intended caller is the
    /// signaling integration, which wraps the material for remote
    /// participants.
    pub fn expose(&self) -> &[u8; KEY_MATERIAL_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}
