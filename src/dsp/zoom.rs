//! Zoom mapping engine: bin↔pixel correspondence tables.
//!
//! The display is backed by a transform with far more usable bins than
//! pixels. For every (pan, zoom, width) triple the engine picks exactly one
//! representative source bin per pixel (nearest-bin policy, no averaging) as
//! a pure function of those parameters, so identical requests always yield
//! identical tables. Tables are recomputed only when the triple changes;
//! recomputation cost is never paid per sample.

use crate::wf::MAX_ZOOM;

/// The parameter triple a map was computed from. Tables are valid only for
/// their key; any difference forces recomputation before the next emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoomKey {
    pub start: u32,
    pub zoom: u32,
    pub plot_width: usize,
}

/// Forward and inverse bin↔pixel tables for one channel.
///
/// The inverse table (`pixel -> bin`, 1:1 with the plot) is the authoritative
/// source at emission time. The forward table (`bin -> pixel`, 1:1 with the
/// usable transform half) lets producer-side code walk bins in order for
/// incremental/overlap accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoomMap {
    key: ZoomKey,
    /// Pan start after clamping the window into the usable half.
    start: u32,
    /// Source bins spanned by the display at this zoom.
    span: usize,
    wf2fft: Vec<u16>,
    fft2wf: Vec<u16>,
}

impl ZoomMap {
    /// Compute tables for the given triple over `usable_bins` source bins.
    ///
    /// All out-of-range parameters clamp silently: the plot width to the
    /// usable half (never more pixels than source bins), the span to the
    /// finest available resolution (one bin per pixel), and the pan so the
    /// displayed window never leaves the usable half (no wrap).
    pub fn compute(key: ZoomKey, usable_bins: usize) -> Self {
        assert!(usable_bins > 0);
        let width = key.plot_width.clamp(1, usable_bins);

        let zoom = key.zoom.min(MAX_ZOOM);
        let span = (usable_bins >> zoom).clamp(width, usable_bins);
        let max_start = (usable_bins - span) as u32;
        let start = key.start.min(max_start);
        let wf2fft: Vec<u16> = (0..width)
            .map(|p| (start as usize + p * span / width) as u16)
            .collect();

        let fft2wf: Vec<u16> = (0..usable_bins)
            .map(|b| {
                if b < start as usize {
                    0
                } else if b >= start as usize + span {
                    (width - 1) as u16
                } else {
                    ((b - start as usize) * width / span) as u16
                }
            })
            .collect();

        Self {
            key,
            start,
            span,
            wf2fft,
            fft2wf,
        }
    }

    #[inline]
    pub fn key(&self) -> ZoomKey {
        self.key
    }

    /// Pan position actually displayed, after clamping.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.span
    }

    #[inline]
    pub fn plot_width(&self) -> usize {
        self.wf2fft.len()
    }

    /// Representative source bin for a display pixel.
    #[inline]
    pub fn bin_for_pixel(&self, pixel: usize) -> usize {
        self.wf2fft[pixel] as usize
    }

    /// Display pixel a source bin contributes to (edge-clamped outside the
    /// displayed window).
    #[inline]
    pub fn pixel_for_bin(&self, bin: usize) -> usize {
        self.fft2wf[bin] as usize
    }

    #[inline]
    pub fn inverse(&self) -> &[u16] {
        &self.wf2fft
    }

    #[inline]
    pub fn forward(&self) -> &[u16] {
        &self.fft2wf
    }
}

/// Cache holding the most recent map; recomputes only on key change.
#[derive(Debug, Default)]
pub struct MapCache {
    map: Option<ZoomMap>,
}

impl MapCache {
    /// Returns the map for `key` and whether it had to be recomputed.
    pub fn ensure(&mut self, key: ZoomKey, usable_bins: usize) -> (&ZoomMap, bool) {
        let stale = match &self.map {
            Some(map) => map.key() != key,
            None => true,
        };
        if stale {
            self.map = Some(ZoomMap::compute(key, usable_bins));
        }
        (self.map.as_ref().unwrap(), stale)
    }

    pub fn invalidate(&mut self) {
        self.map = None;
    }

    pub fn current(&self) -> Option<&ZoomMap> {
        self.map.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USABLE: usize = 4096;

    fn key(start: u32, zoom: u32, plot_width: usize) -> ZoomKey {
        ZoomKey {
            start,
            zoom,
            plot_width,
        }
    }

    #[test]
    fn inverse_map_is_exactly_plot_width_of_valid_bins() {
        for &(start, zoom, width) in &[(0, 0, 1024), (100, 3, 777), (4000, 14, 512), (0, 7, 1)] {
            let map = ZoomMap::compute(key(start, zoom, width), USABLE);
            assert_eq!(map.inverse().len(), width);
            assert!(map.inverse().iter().all(|&b| (b as usize) < USABLE));
        }
    }

    #[test]
    fn mapping_is_deterministic() {
        let a = ZoomMap::compute(key(123, 4, 1000), USABLE);
        let b = ZoomMap::compute(key(123, 4, 1000), USABLE);
        assert_eq!(a, b);
    }

    #[test]
    fn zoom_zero_uses_coarsest_ratio() {
        let map = ZoomMap::compute(key(0, 0, 1024), USABLE);
        assert_eq!(map.span(), USABLE);
        assert_eq!(map.bin_for_pixel(0), 0);
        assert_eq!(map.bin_for_pixel(1), USABLE / 1024);
        assert_eq!(map.bin_for_pixel(1023), USABLE - USABLE / 1024);
    }

    #[test]
    fn max_zoom_is_one_bin_per_pixel_within_window() {
        let map = ZoomMap::compute(key(512, MAX_ZOOM, 1024), USABLE);
        assert_eq!(map.span(), 1024);
        for p in 0..1024 {
            let bin = map.bin_for_pixel(p);
            assert_eq!(bin, 512 + p);
            assert!((512..512 + 1024).contains(&bin));
        }
    }

    #[test]
    fn pan_clamps_instead_of_wrapping() {
        let map = ZoomMap::compute(key(u32::MAX, MAX_ZOOM, 1024), USABLE);
        assert_eq!(map.start() as usize, USABLE - 1024);
        assert_eq!(map.bin_for_pixel(1023), USABLE - 1);
    }

    #[test]
    fn plot_width_clamps_to_usable_bins() {
        let map = ZoomMap::compute(key(0, 0, 1024), 128);
        assert_eq!(map.plot_width(), 128);
        assert_eq!(map.span(), 128);
        let degenerate = ZoomMap::compute(key(0, 0, 0), 128);
        assert_eq!(degenerate.plot_width(), 1);
    }

    #[test]
    fn resolution_clamps_to_finest_available() {
        // zoom deep enough that usable >> zoom is below the plot width
        let map = ZoomMap::compute(key(0, 12, 1024), USABLE);
        assert_eq!(map.span(), 1024);
    }

    #[test]
    fn forward_and_inverse_agree_within_decimation_tolerance() {
        let map = ZoomMap::compute(key(256, 2, 1024), USABLE);
        let ratio = map.span().div_ceil(map.plot_width()).max(1);
        for p in 0..map.plot_width() {
            let bin = map.bin_for_pixel(p);
            let back = map.pixel_for_bin(bin);
            assert!(
                back.abs_diff(p) <= ratio,
                "pixel {p} -> bin {bin} -> pixel {back} exceeds tolerance {ratio}"
            );
        }
    }

    #[test]
    fn forward_map_clamps_out_of_window_bins_to_edges() {
        let map = ZoomMap::compute(key(1024, 2, 1024), USABLE);
        assert_eq!(map.pixel_for_bin(0), 0);
        assert_eq!(map.pixel_for_bin(USABLE - 1), 1023);
    }

    #[test]
    fn cache_recomputes_only_on_key_change() {
        let mut cache = MapCache::default();
        let (_, recomputed) = cache.ensure(key(0, 0, 1024), USABLE);
        assert!(recomputed);
        let (_, recomputed) = cache.ensure(key(0, 0, 1024), USABLE);
        assert!(!recomputed);
        let (map, recomputed) = cache.ensure(key(0, 1, 1024), USABLE);
        assert!(recomputed);
        assert_eq!(map.span(), USABLE / 2);
    }
}
