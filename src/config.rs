use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_RING_SIZE: usize = 16;
pub const DEFAULT_RATCHET_WINDOW: usize = 8;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
pub const DEFAULT_REDUNDANCY_LEVEL: usize = 1;
pub const DEFAULT_INNER_OPUS_PAYLOAD_TYPE: u8 = 111;

/// Config is used to configure the e2ee engine.
/// After a Config is passed to a FrameCryptor or KeyHandler it must not be
/// modified; the only runtime-adjustable knob is the redundancy level, which
/// has its own operation on the cryptor handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of simultaneously retained keys per participant.
    pub ring_size: usize,
    /// Minimum interval between automatic ratchets after participants join.
    pub ratchet_debounce: Duration,
    /// Minimum interval between automatic rotations after participants leave.
    pub rotate_debounce: Duration,
    /// Number of previous audio frames prepended as RFC 2198 redundancy.
    pub redundancy_level: usize,
    /// RTP payload type of the opus blocks inside a redundancy payload.
    pub inner_opus_payload_type: u8,
    /// How many times a receive context ratchets a remote key forward when a
    /// frame fails to authenticate, before giving up and dropping the frame.
    pub ratchet_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ring_size: DEFAULT_RING_SIZE,
            ratchet_debounce: DEFAULT_DEBOUNCE,
            rotate_debounce: DEFAULT_DEBOUNCE,
            redundancy_level: DEFAULT_REDUNDANCY_LEVEL,
            inner_opus_payload_type: DEFAULT_INNER_OPUS_PAYLOAD_TYPE,
            ratchet_window: DEFAULT_RATCHET_WINDOW,
        }
    }
}

impl Config {
    /// validate rejects configurations the engine cannot run with. Checked
    /// once at initialization; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.ring_size == 0 || self.ring_size > 256 {
            return Err(Error::InvalidRingSize(self.ring_size));
        }
        if self.inner_opus_payload_type >= 0x80 {
            return Err(Error::InvalidPayloadType(self.inner_opus_payload_type));
        }
        Ok(())
    }
}
