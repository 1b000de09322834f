//! Frame boundary detection for the serial byte stream.
//!
//! The decoder is fed whatever the serial link produces (arbitrary chunk
//! sizes, garbage between frames, partial frames) and yields complete frames
//! only. Corruption is handled by byte-level resynchronization: drop one byte,
//! scan forward for the next sentinel. Resync runs are counted so the
//! orchestrator can feed them into its parsing-error bookkeeping; the decoder
//! itself never fails.

use crate::{FRAME_SENTINEL, MAX_FRAME_PAYLOAD};

/// One sentinel-delimited unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

/// Restartable pull decoder over an append-only byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    resync_events: u64,
    discarded_bytes: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the serial link.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// Returns `None` when more input is needed; partial frames are never
    /// emitted. Call repeatedly until `None` to drain everything buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let dropped = self.align_to_sentinel();
            if dropped > 0 {
                self.resync_events += 1;
                self.discarded_bytes += dropped as u64;
            }

            if self.buf.len() < 4 {
                return None;
            }

            let len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_PAYLOAD {
                // False sentinel match inside other data. Shift by one byte
                // and rescan rather than swallowing a bogus mega-frame.
                self.buf.drain(..1);
                self.resync_events += 1;
                self.discarded_bytes += 1;
                continue;
            }

            if self.buf.len() < 4 + len {
                return None;
            }

            let payload = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            return Some(Frame { payload });
        }
    }

    /// Discard leading bytes until the buffer starts with the sentinel (or
    /// with a lone first sentinel byte that the next read may complete).
    fn align_to_sentinel(&mut self) -> usize {
        let mut idx = 0;
        while idx < self.buf.len() {
            if self.buf[idx] == FRAME_SENTINEL[0] {
                match self.buf.get(idx + 1) {
                    Some(&b) if b == FRAME_SENTINEL[1] => break,
                    None => break, // wait for the second sentinel byte
                    Some(_) => {}
                }
            }
            idx += 1;
        }
        self.buf.drain(..idx);
        idx
    }

    /// Resync runs observed so far (contiguous discard bursts count once).
    pub fn resync_events(&self) -> u64 {
        self.resync_events
    }

    /// Total bytes thrown away while resynchronizing.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Resync runs since the last call; used by the gateway's per-cycle
    /// parsing-error accounting.
    pub fn take_resync_events(&mut self) -> u64 {
        std::mem::take(&mut self.resync_events)
    }

    /// Drop all buffered bytes (after a device reset).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = FRAME_SENTINEL.to_vec();
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_single_frame() {
        let mut dec = FrameDecoder::new();
        dec.extend(&framed(&[1, 2, 3]));
        assert_eq!(dec.next_frame().unwrap().payload, vec![1, 2, 3]);
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.resync_events(), 0);
    }

    #[test]
    fn waits_for_partial_frame() {
        let mut dec = FrameDecoder::new();
        let bytes = framed(&[9, 9, 9, 9]);
        dec.extend(&bytes[..5]);
        assert_eq!(dec.next_frame(), None);
        dec.extend(&bytes[5..]);
        assert_eq!(dec.next_frame().unwrap().payload, vec![9, 9, 9, 9]);
    }

    #[test]
    fn resyncs_past_garbage_prefix() {
        let mut dec = FrameDecoder::new();
        let mut bytes = vec![0x00, 0xFF, 0xDC, 0x13]; // 0xDC not followed by 0xAC
        bytes.extend_from_slice(&framed(&[7]));
        dec.extend(&bytes);
        assert_eq!(dec.next_frame().unwrap().payload, vec![7]);
        assert_eq!(dec.resync_events(), 1);
        assert_eq!(dec.discarded_bytes(), 4);
    }

    #[test]
    fn corrupted_frame_does_not_halt_decoding() {
        // A sentinel whose declared length is implausible must be skipped
        // byte-by-byte, and the following well-formed frame still decodes.
        let mut dec = FrameDecoder::new();
        let mut bytes = vec![0xDC, 0xAC, 0xFF, 0xFF]; // len = 65535
        bytes.extend_from_slice(&framed(b"ok"));
        dec.extend(&bytes);
        assert_eq!(dec.next_frame().unwrap().payload, b"ok".to_vec());
        assert!(dec.resync_events() > 0);
    }

    #[test]
    fn lone_trailing_sentinel_byte_is_kept() {
        let mut dec = FrameDecoder::new();
        dec.extend(&[0x11, 0xDC]);
        assert_eq!(dec.next_frame(), None);
        dec.extend(&[0xAC, 0x01, 0x00, 0x42]);
        assert_eq!(dec.next_frame().unwrap().payload, vec![0x42]);
    }

    #[test]
    fn drains_back_to_back_frames() {
        let mut dec = FrameDecoder::new();
        let mut bytes = framed(&[1]);
        bytes.extend_from_slice(&framed(&[2]));
        bytes.extend_from_slice(&framed(&[]));
        dec.extend(&bytes);
        assert_eq!(dec.next_frame().unwrap().payload, vec![1]);
        assert_eq!(dec.next_frame().unwrap().payload, vec![2]);
        assert_eq!(dec.next_frame().unwrap().payload, Vec::<u8>::new());
        assert_eq!(dec.next_frame(), None);
    }

    #[test]
    fn take_resync_events_resets_counter() {
        let mut dec = FrameDecoder::new();
        dec.extend(&[0x55, 0x66]);
        dec.extend(&framed(&[3]));
        assert!(dec.next_frame().is_some());
        assert_eq!(dec.take_resync_events(), 1);
        assert_eq!(dec.take_resync_events(), 0);
    }
}
