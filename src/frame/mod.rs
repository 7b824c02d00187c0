
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

/// Length of the per-frame initialization vector carried after the ciphertext.
pub const IV_LEN: usize = 12;
/// Length of the trailing key index field.
pub const KEY_INDEX_LEN: usize = 1;
/// IV plus key index, appended to every encrypted frame.
pub const TRAILER_LEN: usize = IV_LEN + KEY_INDEX_LEN;
/// AES-GCM authentication tag length.
pub const AUTH_TAG_LEN: usize = 16;

/// MediaKind tells a pipeline whether it carries audio or video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// FrameKind determines how many leading bytes of an encoded frame stay
/// unencrypted so the forwarding infrastructure can still route and pace the
/// stream. The values match the codec headers a selective forwarder needs to
/// read: the full VP8 payload header for key frames, the short header for
/// delta frames, and the opus TOC byte for audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    KeyVideo,
    DeltaVideo,
    Audio,
}

impl FrameKind {
    /// unencrypted_bytes returns the length of the plaintext prefix, which is
    /// copied verbatim into the encrypted frame and authenticated as AAD.
    pub fn unencrypted_bytes(&self) -> usize {
        match self {
            FrameKind::KeyVideo => 10,
            FrameKind::DeltaVideo => 3,
            FrameKind::Audio => 1,
        }
    }

    /// classify maps an encoded frame to its FrameKind. Video frames without a
    /// codec-reported type fall back to the VP8 payload header: the low bit of
    /// the first octet is the inverse key frame flag (0 = key, 1 = delta).
    pub fn classify(kind: MediaKind, key_frame: Option<bool>, payload: &[u8]) -> FrameKind {
        match kind {
            MediaKind::Audio => FrameKind::Audio,
            MediaKind::Video => match key_frame {
                Some(true) => FrameKind::KeyVideo,
                Some(false) => FrameKind::DeltaVideo,
                None => {
                    if payload.first().map_or(false, |b| b & 0x01 == 0x01) {
                        FrameKind::DeltaVideo
                    } else {
                        FrameKind::KeyVideo
                    }
                }
            },
        }
    }
}

/// EncodedFrame is one encoder output unit together with the RTP metadata the
/// transform needs: the stream SSRC and the media clock timestamp.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub payload: Bytes,
    pub ssrc: u32,
    pub timestamp: u32,
    /// Codec-reported key frame flag for video. None means the codec did not
    /// say and the payload header is inspected instead.
    pub key_frame: Option<bool>,
}

/// The 96-bit IV is the big-endian concatenation of the stream SSRC, the RTP
/// timestamp and the low 16 bits of the per-SSRC send counter zero-extended
/// to 32 bits. The counter never repeats under one key within its 16-bit
/// cycle, and rotation replaces the key long before SSRC+timestamp reuse.
pub(crate) fn frame_iv(ssrc: u32, timestamp: u32, send_counter: u16) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    BigEndian::write_u32(&mut iv[..4], ssrc);
    BigEndian::write_u32(&mut iv[4..8], timestamp);
    BigEndian::write_u32(&mut iv[8..], send_counter as u32);
    iv
}
