#[cfg(test)]
mod context_test;

use std::collections::HashMap;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::Nonce;
use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::frame::{frame_iv, FrameKind, IV_LEN, TRAILER_LEN};
use crate::key_derivation::KeyMaterial;
use crate::key_ring::KeyRing;

/// Outcome of decrypting a single incoming frame.
#[derive(Debug, PartialEq)]
pub enum DecryptOutcome {
    /// The frame authenticated and decrypted.
    Plaintext(Bytes),
    /// No key is known at the frame's index; the frame is handed on
    /// unchanged. Expected during the short window after a key rotation,
    /// before the new key has propagated.
    Passthrough(Bytes),
}

/// Context holds the cryptographic state for one participant: that
/// participant's key ring plus per-SSRC send counters.
///
/// A Context can only be used for one-way operations: it either encrypts the
/// local participant's outgoing frames or decrypts one remote participant's
/// incoming frames.
pub struct Context {
    ring: KeyRing,
    send_counters: HashMap<u32, u16>,
    ratchet_window: usize,
}

impl Context {
    /// new creates a Context with an empty ring. `ratchet_window` bounds
    /// decrypt-side ratchet recovery and is zero for send contexts.
    pub fn new(ring_size: usize, ratchet_window: usize) -> Context {
        Context {
            ring: KeyRing::new(ring_size),
            send_counters: HashMap::new(),
            ratchet_window,
        }
    }

    /// set_key installs key material at the given index and makes it current
    /// if it is newer than the cursor.
    pub fn set_key(&mut self, material: KeyMaterial, index: u8) -> Result<()> {
        self.ring.set(material, index)
    }

    pub fn clear_key(&mut self, index: u8) {
        self.ring.clear(index);
    }

    pub fn clear_all(&mut self) {
        self.ring.clear_all();
    }

    pub fn current_key_index(&self) -> Option<u8> {
        self.ring.current().map(|(index, _)| index)
    }

    // The counter starts at a random 16-bit offset per SSRC and increments by
    // one per encrypted frame, wrapping mod 2^16.
    fn next_send_counter(&mut self, ssrc: u32) -> u16 {
        let counter = self
            .send_counters
            .entry(ssrc)
            .or_insert_with(|| OsRng.next_u32() as u16);
        let value = *counter;
        *counter = counter.wrapping_add(1);
        value
    }

    /// encrypt_frame transforms one outgoing encoded frame into the encrypted
    /// wire layout: `prefix || ciphertext+tag || IV || key index`. The prefix
    /// stays plaintext and is bound to the ciphertext as AAD.
    ///
    /// With no current key the frame is returned unchanged; transport-level
    /// protection still applies. This is the documented fallback while e2ee
    /// key exchange has not completed.
    pub fn encrypt_frame(
        &mut self,
        kind: FrameKind,
        ssrc: u32,
        timestamp: u32,
        payload: &Bytes,
    ) -> Result<Bytes> {
        if self.ring.current().is_none() {
            return Ok(payload.clone());
        }
        let counter = self.next_send_counter(ssrc);
        let iv = frame_iv(ssrc, timestamp, counter);

        let (index, entry) = match self.ring.current() {
            Some(current) => current,
            None => return Ok(payload.clone()),
        };

        let prefix_len = kind.unencrypted_bytes().min(payload.len());
        let (prefix, plaintext) = payload.split_at(prefix_len);

        let ciphertext = entry.cipher.encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: prefix,
            },
        )?;

        let mut writer = BytesMut::with_capacity(prefix_len + ciphertext.len() + TRAILER_LEN);
        writer.extend_from_slice(prefix);
        writer.extend_from_slice(&ciphertext);
        writer.extend_from_slice(&iv);
        writer.extend_from_slice(&[index]);
        Ok(writer.freeze())
    }

    /// decrypt_frame reverses encrypt_frame. The IV is taken from the frame
    /// as-is; it is never reconstructed from RTP metadata. An unknown key
    /// index yields Passthrough, a frame shorter than the minimum envelope
    /// FrameTooShort, and an authentication failure that survives ratchet
    /// recovery FailedToDecryptFrame.
    pub fn decrypt_frame(&mut self, kind: FrameKind, payload: &Bytes) -> Result<DecryptOutcome> {
        let key_index = match payload.last() {
            Some(&index) => index,
            None => return Ok(DecryptOutcome::Passthrough(payload.clone())),
        };
        let entry = match self.ring.get(key_index) {
            Some(entry) => entry,
            None => return Ok(DecryptOutcome::Passthrough(payload.clone())),
        };

        let prefix_len = kind.unencrypted_bytes();
        if payload.len() < prefix_len + TRAILER_LEN {
            return Err(Error::FrameTooShort(payload.len(), prefix_len + TRAILER_LEN));
        }

        let iv_start = payload.len() - TRAILER_LEN;
        let iv = &payload[iv_start..iv_start + IV_LEN];
        let prefix = &payload[..prefix_len];
        let ciphertext = &payload[prefix_len..iv_start];

        match entry.cipher.decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: prefix,
            },
        ) {
            Ok(plaintext) => Ok(DecryptOutcome::Plaintext(Self::assemble(prefix, &plaintext))),
            Err(_) => self.ratchet_recover(kind, key_index, payload),
        }
    }

    // The sender may have ratcheted ahead of its announcement. Walk the
    // material chain forward a bounded number of steps and adopt the first
    // key that authenticates the frame; keep the original material if none
    // does.
    fn ratchet_recover(
        &mut self,
        kind: FrameKind,
        key_index: u8,
        payload: &Bytes,
    ) -> Result<DecryptOutcome> {
        let mut material = match self.ring.get(key_index) {
            Some(entry) => entry.material.clone(),
            None => return Err(Error::FailedToDecryptFrame),
        };

        let prefix_len = kind.unencrypted_bytes();
        let iv_start = payload.len() - TRAILER_LEN;
        let iv = &payload[iv_start..iv_start + IV_LEN];
        let prefix = &payload[..prefix_len];
        let ciphertext = &payload[prefix_len..iv_start];

        for _ in 0..self.ratchet_window {
            material = material.ratchet()?;
            let cipher = material.derive_encryption_key()?;
            if let Ok(plaintext) = cipher.decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad: prefix,
                },
            ) {
                log::debug!("ratchet recovery caught up with sender at index {key_index}");
                self.ring.replace_material(key_index, material)?;
                return Ok(DecryptOutcome::Plaintext(Self::assemble(prefix, &plaintext)));
            }
        }
        Err(Error::FailedToDecryptFrame)
    }

    fn assemble(prefix: &[u8], plaintext: &[u8]) -> Bytes {
        let mut writer = BytesMut::with_capacity(prefix.len() + plaintext.len());
        writer.extend_from_slice(prefix);
        writer.extend_from_slice(plaintext);
        writer.freeze()
    }
}
