#[cfg(test)]
mod key_ring_test;

use aes_gcm::Aes128Gcm;

use crate::error::Result;
use crate::key_derivation::KeyMaterial;

/// One slot of the ring: the announced key index, the raw material it was
/// announced with and the AES-GCM key derived from it. The material is kept
/// so a receive context can ratchet it forward when a sender runs ahead of
/// its announcement.
pub(crate) struct KeyRingEntry {
    pub(crate) index: u8,
    pub(crate) material: KeyMaterial,
    pub(crate) cipher: Aes128Gcm,
}

/// KeyRing is a bounded mapping from key index to derived key for a single
/// participant. Writes land at `index % capacity`; each slot remembers the
/// index it was written with, so a lookup for an index evicted by ring
/// rollover misses instead of aliasing a newer key.
///
/// A ring is owned by the cryptor worker and is never shared across threads;
/// every read and write happens on the worker.
pub(crate) struct KeyRing {
    entries: Vec<Option<KeyRingEntry>>,
    current: Option<u8>,
}

impl KeyRing {
    /// new creates an empty ring. The capacity comes from Config::ring_size
    /// and has already been validated.
    pub(crate) fn new(capacity: usize) -> KeyRing {
        KeyRing {
            entries: (0..capacity).map(|_| None).collect(),
            current: None,
        }
    }

    fn slot(&self, index: u8) -> usize {
        index as usize % self.entries.len()
    }

    /// set derives the encryption key and stores the pair. Repeated
    /// announcements at the same index overwrite: the signaling layer is
    /// serialized per sender, so last write wins.
    pub(crate) fn set(&mut self, material: KeyMaterial, index: u8) -> Result<()> {
        let cipher = material.derive_encryption_key()?;
        let slot = self.slot(index);
        self.entries[slot] = Some(KeyRingEntry {
            index,
            material,
            cipher,
        });
        self.advance_current(index);
        Ok(())
    }

    // The cursor only moves forward: an announcement is newer than the cursor
    // when it sits at most half the ring ahead in modular distance. An
    // announcement landing on the cursor's own slot replaces it in place.
    fn advance_current(&mut self, index: u8) {
        let capacity = self.entries.len() as i32;
        match self.current {
            None => self.current = Some(index),
            Some(current) => {
                let dist = (index as i32 - current as i32).rem_euclid(capacity);
                if dist == 0 || dist <= capacity / 2 {
                    self.current = Some(index);
                }
            }
        }
    }

    /// get returns the entry at the index, if it is still present and was
    /// written with exactly that index.
    pub(crate) fn get(&self, index: u8) -> Option<&KeyRingEntry> {
        self.entries[self.slot(index)]
            .as_ref()
            .filter(|entry| entry.index == index)
    }

    /// replace_material swaps the material (and derived key) at an occupied
    /// index without touching the cursor. Used by decrypt-side ratchet
    /// recovery once a forwarded material authenticates a frame.
    pub(crate) fn replace_material(&mut self, index: u8, material: KeyMaterial) -> Result<()> {
        let cipher = material.derive_encryption_key()?;
        let slot = self.slot(index);
        self.entries[slot] = Some(KeyRingEntry {
            index,
            material,
            cipher,
        });
        Ok(())
    }

    /// current returns the cursor's entry, the one the local sender encrypts
    /// with.
    pub(crate) fn current(&self) -> Option<(u8, &KeyRingEntry)> {
        let current = self.current?;
        self.get(current).map(|entry| (current, entry))
    }

    pub(crate) fn clear(&mut self, index: u8) {
        let slot = self.slot(index);
        if let Some(entry) = &self.entries[slot] {
            if entry.index == index {
                self.entries[slot] = None;
            }
        }
    }

    pub(crate) fn clear_all(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
        self.current = None;
    }
}
