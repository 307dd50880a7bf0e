//! Waterfall wire format and packet encoder.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! id4[4] | x_bin: u32 | flags_zoom: u32 | seq: u32 | payload
//! ```
//!
//! `x_bin` is the pan position, `flags_zoom` carries the zoom level in the
//! low bits with bit 16 set when the payload is compressed. The payload is
//! one byte per display pixel, or the priming pad plus the ADPCM nibble
//! stream when compression is active. The stream is lossy, latest-wins:
//! clients detect loss from sequence gaps; there is no retransmission.

use crate::net::adpcm;
use crate::wf::flow::QuantizedRow;
use crate::wf::ChannelId;

pub const WF_ID4: [u8; 4] = *b"W/F ";
pub const WF_FLAGS_COMPRESSION: u32 = 0x0001_0000;
pub const HEADER_LEN: usize = 16;

/// Map a dB magnitude into one byte over the channel's display range:
/// 0 at or below `mindb`, 255 at or above `maxdb`, linear in between.
#[inline]
pub fn quantize_db(db: f32, mindb: i32, maxdb: i32) -> u8 {
    debug_assert!(maxdb > mindb);
    let range = (maxdb - mindb) as f32;
    let norm = (db - mindb as f32) / range;
    if norm <= 0.0 {
        0
    } else if norm >= 1.0 {
        255
    } else {
        (norm * 255.0 + 0.5) as u8
    }
}

/// One encoded waterfall packet, constructed fresh per emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    pub channel: ChannelId,
    pub seq: u32,
    pub compressed: bool,
    pub bytes: Vec<u8>,
}

impl OutputPacket {
    pub fn x_bin(&self) -> u32 {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    pub fn flags_zoom(&self) -> u32 {
        u32::from_le_bytes(self.bytes[8..12].try_into().unwrap())
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }
}

/// Per-channel packet encoder. Owns the monotonic sequence counter; the
/// counter wraps at the field width and survives parameter changes.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    seq: u32,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn next_seq(&self) -> u32 {
        self.seq
    }

    /// Serialize one quantized row. Encoding cannot fail: buffers are fixed
    /// size and inputs arrive clamped, so malformed rows are programming
    /// errors and assert.
    pub fn encode(&mut self, channel: ChannelId, row: &QuantizedRow, compress: bool) -> OutputPacket {
        assert!(
            !row.pixels.is_empty(),
            "encoder given an empty row for {channel}"
        );

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut flags_zoom = row.zoom;
        let payload_len = if compress {
            adpcm::encoded_len(row.pixels.len())
        } else {
            row.pixels.len()
        };

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload_len);
        bytes.extend_from_slice(&WF_ID4);
        bytes.extend_from_slice(&row.start.to_le_bytes());
        if compress {
            flags_zoom |= WF_FLAGS_COMPRESSION;
        }
        bytes.extend_from_slice(&flags_zoom.to_le_bytes());
        bytes.extend_from_slice(&seq.to_le_bytes());

        if compress {
            bytes.extend_from_slice(&adpcm::encode_row(&row.pixels));
        } else {
            bytes.extend_from_slice(&row.pixels);
        }
        debug_assert_eq!(bytes.len(), HEADER_LEN + payload_len);

        OutputPacket {
            channel,
            seq,
            compressed: compress,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wf::NoiseBlanker;
    use std::time::Instant;

    fn row(pixels: Vec<u8>, start: u32, zoom: u32) -> QuantizedRow {
        QuantizedRow {
            pixels,
            start,
            zoom,
            noise_blanker: NoiseBlanker::default(),
            captured: Instant::now(),
        }
    }

    #[test]
    fn quantization_clamps_and_is_linear() {
        assert_eq!(quantize_db(-160.0, -160, -20), 0);
        assert_eq!(quantize_db(-200.0, -160, -20), 0);
        assert_eq!(quantize_db(-20.0, -160, -20), 255);
        assert_eq!(quantize_db(0.0, -160, -20), 255);
        // round(255 * 70 / 140) = 128 (half-up)
        assert_eq!(quantize_db(-90.0, -160, -20), 128);
    }

    #[test]
    fn raw_packet_layout() {
        let mut enc = PacketEncoder::new();
        let pkt = enc.encode(ChannelId::new(3), &row(vec![7u8; 1024], 512, 9), false);
        assert_eq!(&pkt.bytes[..4], b"W/F ");
        assert_eq!(pkt.x_bin(), 512);
        assert_eq!(pkt.flags_zoom(), 9);
        assert_eq!(pkt.seq, 0);
        assert_eq!(pkt.payload().len(), 1024);
        assert!(!pkt.compressed);
    }

    #[test]
    fn compressed_packet_sets_flag_and_shrinks_payload() {
        let mut enc = PacketEncoder::new();
        let pkt = enc.encode(ChannelId::new(0), &row(vec![128u8; 1024], 0, 0), true);
        assert_ne!(pkt.flags_zoom() & WF_FLAGS_COMPRESSION, 0);
        assert_eq!(pkt.flags_zoom() & 0xffff, 0);
        assert!(pkt.payload().len() < 1024);
        assert_eq!(pkt.payload().len(), crate::net::adpcm::encoded_len(1024));
    }

    #[test]
    fn sequence_numbers_are_consecutive_and_wrap() {
        let mut enc = PacketEncoder::new();
        let r = row(vec![1u8; 8], 0, 0);
        for expect in 0..5u32 {
            let pkt = enc.encode(ChannelId::new(0), &r, false);
            assert_eq!(pkt.seq, expect);
        }

        let mut enc = PacketEncoder { seq: u32::MAX };
        let last = enc.encode(ChannelId::new(0), &r, false);
        assert_eq!(last.seq, u32::MAX);
        let wrapped = enc.encode(ChannelId::new(0), &r, false);
        assert_eq!(wrapped.seq, 0);
    }
}
