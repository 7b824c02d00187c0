
use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound (exclusive) on the 14-bit timestamp offset of a redundant
/// block header.
pub const MAX_TIMESTAMP_OFFSET: u32 = 1 << 14;
/// Largest block length expressible in the 10-bit length field.
pub const MAX_BLOCK_LENGTH: usize = (1 << 10) - 1;

const BLOCK_HEADER_LEN: usize = 4;
const TERMINATOR_HEADER_LEN: usize = 1;

/// RedEncoder wraps opus frames in RFC 2198 redundancy: up to `redundancy`
/// previous frames are prepended to the current one, so a receiver that lost
/// a packet can still decode its audio from the packet that follows.
///
/// Each redundant block carries a 4-byte header, the final (current) block a
/// 1-byte terminator:
///
/// ```text
///  0                   1                    2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7  8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |F|   block PT  |  timestamp offset         |   block length    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// <https://tools.ietf.org/html/rfc2198#section-3>
pub struct RedEncoder {
    payload_type: u8,
    redundancy: usize,
    history: VecDeque<(Bytes, u32)>,
}

impl RedEncoder {
    /// new creates an encoder emitting `payload_type` as the inner opus block
    /// type, retaining up to `redundancy` previous frames.
    pub fn new(payload_type: u8, redundancy: usize) -> RedEncoder {
        RedEncoder {
            payload_type,
            redundancy,
            history: VecDeque::new(),
        }
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    /// set_redundancy resizes the history. Growing keeps the existing frames
    /// in the most-recent positions; shrinking drops the oldest.
    pub fn set_redundancy(&mut self, redundancy: usize) {
        self.redundancy = redundancy;
        while self.history.len() > redundancy {
            self.history.pop_front();
        }
    }

    /// encode emits the RFC 2198 payload for the current frame: one header
    /// per retained previous frame, the terminator header, then all block
    /// payloads oldest first. The current frame is never delayed or dropped;
    /// only the amount of prepended redundancy varies.
    pub fn encode(&mut self, payload: &Bytes, timestamp: u32) -> Bytes {
        // A block whose timestamp offset or length does not fit the header
        // fields is left out; emitting it would produce a malformed payload.
        // Offsets are computed with wrapping arithmetic so redundancy
        // survives 32-bit RTP timestamp rollover.
        let mut blocks: Vec<(&Bytes, u32)> = Vec::with_capacity(self.history.len());
        for (data, ts) in &self.history {
            let offset = timestamp.wrapping_sub(*ts);
            if offset >= MAX_TIMESTAMP_OFFSET || data.len() > MAX_BLOCK_LENGTH {
                continue;
            }
            blocks.push((data, offset));
        }

        let blocks_len: usize = blocks.iter().map(|(data, _)| data.len()).sum();
        let mut writer = BytesMut::with_capacity(
            BLOCK_HEADER_LEN * blocks.len() + TERMINATOR_HEADER_LEN + blocks_len + payload.len(),
        );

        for (data, offset) in &blocks {
            writer.put_u8(0x80 | self.payload_type);
            let field = (*offset << 10) | data.len() as u32;
            writer.put_u8((field >> 16) as u8);
            writer.put_u8((field >> 8) as u8);
            writer.put_u8(field as u8);
        }
        writer.put_u8(self.payload_type);

        for (data, _) in &blocks {
            writer.extend_from_slice(&data[..]);
        }
        writer.extend_from_slice(payload);

        self.push(payload.clone(), timestamp);
        writer.freeze()
    }

    fn push(&mut self, payload: Bytes, timestamp: u32) {
        if self.redundancy == 0 {
            return;
        }
        self.history.push_back((payload, timestamp));
        while self.history.len() > self.redundancy {
            self.history.pop_front();
        }
    }
}
