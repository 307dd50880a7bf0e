//! Waterfall core: per-channel display state, flow control, and the shared
//! fixed-capacity state region.
//!
//! Geometry follows the hardware pipeline: the worst-case transform is sized
//! so that after discarding the mirrored half of the complex FFT there are
//! always enough bins to cover the display at every zoom level.

pub mod channel;
pub mod flow;
pub mod shmem;

use std::fmt;

/// Width of the waterfall display in pixels. Requested plot widths clamp here.
pub const WF_WIDTH: usize = 1024;

/// Only the first half of a complex FFT of real-sourced input carries unique
/// spectral content.
pub const WF_USING_HALF_FFT: usize = 2;
/// Only half of the remaining FFT survives the CIC decimation stage.
pub const WF_USING_HALF_CIC: usize = 2;
/// Extra transform length for a better looking display.
pub const WF_BETTER_LOOKING: usize = 2;

/// Worst-case FFT length any transform context must be able to run.
pub const WF_C_NFFT: usize = WF_WIDTH * WF_USING_HALF_FFT * WF_USING_HALF_CIC * WF_BETTER_LOOKING;
/// Worst-case sample buffer length, matching the transform length.
pub const WF_C_NSAMPS: usize = WF_C_NFFT;

/// Highest zoom level the mapping engine accepts; higher requests clamp.
pub const MAX_ZOOM: u32 = 14;

/// Priming pad preceding a compressed payload, giving the stateful decoder
/// deterministic startup conditions for every packet.
pub const ADPCM_PAD: usize = 10;

/// Identifies one receiver channel. Channel indices are dense and bounded by
/// the configured receiver-channel capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn new(index: usize) -> Self {
        ChannelId(index as u32)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx{}", self.0)
    }
}

/// Advisory noise-blanker metadata carried alongside emitted rows. It never
/// gates emission; clients use it to suppress impulse-noise artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoiseBlanker {
    /// Blanking threshold in dB, 0 = disabled.
    pub threshold: i32,
    /// Click-suppression counter.
    pub click: i32,
    /// Milliseconds since channel start of the last detected pulse.
    pub last_pulse_ms: u32,
}

/// Per-channel display parameters, mutated only through the control surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayParams {
    /// Pan position: offset of the left display edge into the usable
    /// spectrum, in bins of the active transform.
    pub start: u32,
    /// Zoom level; 0 = widest span, `MAX_ZOOM` = finest resolution.
    pub zoom: u32,
    /// Requested plot width in pixels, clamped to [`WF_WIDTH`].
    pub plot_width: usize,
    pub mindb: i32,
    pub maxdb: i32,
    pub compression: bool,
    pub noise_blanker: NoiseBlanker,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self {
            start: 0,
            zoom: 0,
            plot_width: WF_WIDTH,
            mindb: -160,
            maxdb: -20,
            compression: true,
            noise_blanker: NoiseBlanker::default(),
        }
    }
}

impl DisplayParams {
    /// Clamp out-of-range requests per the silent-clamping policy: width to
    /// the display width, zoom to the supported maximum. Pan clamping depends
    /// on the effective span and happens in the mapping engine.
    pub fn clamped(mut self) -> Self {
        self.plot_width = self.plot_width.clamp(1, WF_WIDTH);
        self.zoom = self.zoom.min(MAX_ZOOM);
        if self.maxdb <= self.mindb {
            self.maxdb = self.mindb + 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants_agree() {
        assert_eq!(WF_C_NFFT, 8192);
        assert_eq!(WF_C_NFFT / WF_USING_HALF_FFT, 4096);
        assert!(WF_C_NFFT / WF_USING_HALF_FFT >= WF_WIDTH);
    }

    #[test]
    fn params_clamp_width_and_zoom() {
        let p = DisplayParams {
            plot_width: 4096,
            zoom: 99,
            ..DisplayParams::default()
        }
        .clamped();
        assert_eq!(p.plot_width, WF_WIDTH);
        assert_eq!(p.zoom, MAX_ZOOM);
    }

    #[test]
    fn params_clamp_inverted_db_range() {
        let p = DisplayParams {
            mindb: -50,
            maxdb: -50,
            ..DisplayParams::default()
        }
        .clamped();
        assert!(p.maxdb > p.mindb);
    }
}
