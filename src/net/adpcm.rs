//! IMA ADPCM codec for waterfall rows.
//!
//! Each 8-bit pixel row is widened to centered i16 samples and compressed to
//! one nibble per sample. The encoder state (predictor, step index) resets
//! for every row, and the row is preceded by [`ADPCM_PAD`] copies of its
//! first value so the adaptive state converges before real pixels appear:
//! every packet is independently decodable with deterministic startup
//! conditions. The decoder exists for tests and protocol documentation; the
//! production decoder runs in the remote client.

use crate::wf::ADPCM_PAD;

const INDEX_TABLE: [i32; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

#[derive(Debug, Clone, Copy)]
struct CodecState {
    predictor: i32,
    index: i32,
}

impl CodecState {
    /// Per-packet initial conditions; never carried across packets.
    fn reset() -> Self {
        Self {
            predictor: 0,
            index: 0,
        }
    }
}

#[inline]
fn widen(pixel: u8) -> i32 {
    ((pixel as i32) - 128) << 8
}

#[inline]
fn narrow(sample: i32) -> u8 {
    ((sample >> 8) + 128).clamp(0, 255) as u8
}

fn encode_sample(state: &mut CodecState, sample: i32) -> u8 {
    let step = STEP_TABLE[state.index as usize];
    let diff = sample - state.predictor;
    let sign = if diff < 0 { 8 } else { 0 };
    let mut delta = diff.abs();

    let mut code = 0i32;
    let mut vpdiff = step >> 3;
    if delta >= step {
        code |= 4;
        delta -= step;
        vpdiff += step;
    }
    if delta >= (step >> 1) {
        code |= 2;
        delta -= step >> 1;
        vpdiff += step >> 1;
    }
    if delta >= (step >> 2) {
        code |= 1;
        vpdiff += step >> 2;
    }

    if sign != 0 {
        state.predictor -= vpdiff;
    } else {
        state.predictor += vpdiff;
    }
    state.predictor = state.predictor.clamp(i16::MIN as i32, i16::MAX as i32);

    code |= sign;
    state.index += INDEX_TABLE[code as usize];
    state.index = state.index.clamp(0, (STEP_TABLE.len() - 1) as i32);

    (code as u8) & 0x0f
}

fn decode_sample(state: &mut CodecState, code: u8) -> i32 {
    let step = STEP_TABLE[state.index as usize];

    let mut vpdiff = step >> 3;
    if code & 4 != 0 {
        vpdiff += step;
    }
    if code & 2 != 0 {
        vpdiff += step >> 1;
    }
    if code & 1 != 0 {
        vpdiff += step >> 2;
    }

    if code & 8 != 0 {
        state.predictor -= vpdiff;
    } else {
        state.predictor += vpdiff;
    }
    state.predictor = state.predictor.clamp(i16::MIN as i32, i16::MAX as i32);

    state.index += INDEX_TABLE[(code & 0x0f) as usize];
    state.index = state.index.clamp(0, (STEP_TABLE.len() - 1) as i32);

    state.predictor
}

/// Compressed size of a `row_len`-pixel row including the priming pad.
pub const fn encoded_len(row_len: usize) -> usize {
    (row_len + ADPCM_PAD + 1) / 2
}

/// Encode one pixel row: `ADPCM_PAD` copies of the first pixel followed by
/// the row itself, two nibbles per output byte, low nibble first.
pub fn encode_row(row: &[u8]) -> Vec<u8> {
    assert!(!row.is_empty(), "cannot encode an empty row");
    let mut state = CodecState::reset();
    let mut out = Vec::with_capacity(encoded_len(row.len()));
    let mut pending: Option<u8> = None;

    let pad = std::iter::repeat(row[0]).take(ADPCM_PAD);
    for pixel in pad.chain(row.iter().copied()) {
        let nibble = encode_sample(&mut state, widen(pixel));
        match pending.take() {
            Some(low) => out.push(low | (nibble << 4)),
            None => pending = Some(nibble),
        }
    }
    if let Some(low) = pending {
        out.push(low);
    }

    debug_assert_eq!(out.len(), encoded_len(row.len()));
    out
}

/// Decode `row_len` pixels from an encoded payload, discarding the priming
/// pad. Test/reference counterpart of [`encode_row`].
pub fn decode_row(data: &[u8], row_len: usize) -> Vec<u8> {
    let mut state = CodecState::reset();
    let total = row_len + ADPCM_PAD;
    let mut pixels = Vec::with_capacity(total);
    'outer: for &byte in data {
        for nibble in [byte & 0x0f, byte >> 4] {
            pixels.push(narrow(decode_sample(&mut state, nibble)));
            if pixels.len() == total {
                break 'outer;
            }
        }
    }
    pixels.split_off(ADPCM_PAD.min(pixels.len()))
}
