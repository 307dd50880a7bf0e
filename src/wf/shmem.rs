//! Shared state region.
//!
//! All channel display state, transform-slot bookkeeping, and the shared
//! window table live in one fixed-capacity arena allocated at startup and
//! never resized. Every record is `#[repr(C)]`, fixed-offset, and free of
//! embedded pointers, so the same layout works within one process or across
//! cooperating processes sharing the segment (relative addressing stays
//! valid across address spaces).

use crate::wf::{ChannelId, DisplayParams};
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Backing strategy for the region, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Single-process deployment: the arena is a private heap allocation.
    InProcess,
    /// Multi-core deployment: the arena layout is shared-segment ready.
    SharedSegment,
}

pub const PARAMS_FLAG_COMPRESSION: u32 = 1 << 0;
pub const PARAMS_FLAG_ACTIVE: u32 = 1 << 1;

/// Relocatable mirror of one channel's display parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ChannelParamsRecord {
    pub start: u32,
    pub zoom: u32,
    pub plot_width: u32,
    pub mindb: i32,
    pub maxdb: i32,
    pub flags: u32,
    pub seq: u32,
    pub nb_threshold: i32,
    pub nb_click: i32,
    pub last_pulse_ms: u32,
}

/// Relocatable mirror of one transform slot's binding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TransformSlotRecord {
    /// Bound channel index, -1 when free.
    pub bound_channel: i32,
    pub fft_size: u32,
    pub plan_generation: u32,
    pub reserved: u32,
}

/// Byte offsets of every record in the arena. All offsets are multiples of
/// four; the arena is word-backed so casts stay aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub rx_chans: usize,
    pub wf_chans: usize,
    pub window_len: usize,
    pub params_off: usize,
    pub slots_off: usize,
    pub window_off: usize,
    pub free_off: usize,
    pub total_bytes: usize,
}

impl RegionLayout {
    pub fn compute(rx_chans: usize, wf_chans: usize, window_len: usize) -> Self {
        assert!(rx_chans > 0 && wf_chans > 0 && wf_chans <= rx_chans);
        let params_off = 0;
        let slots_off = params_off + rx_chans * std::mem::size_of::<ChannelParamsRecord>();
        let window_off = slots_off + wf_chans * std::mem::size_of::<TransformSlotRecord>();
        let free_off = window_off + window_len * std::mem::size_of::<f32>();
        let total_bytes = free_off + std::mem::size_of::<u32>();
        Self {
            rx_chans,
            wf_chans,
            window_len,
            params_off,
            slots_off,
            window_off,
            free_off,
            total_bytes,
        }
    }

    fn params_at(&self, chan: usize) -> usize {
        assert!(chan < self.rx_chans, "channel {chan} out of range");
        self.params_off + chan * std::mem::size_of::<ChannelParamsRecord>()
    }

    fn slot_at(&self, slot: usize) -> usize {
        assert!(slot < self.wf_chans, "transform slot {slot} out of range");
        self.slots_off + slot * std::mem::size_of::<TransformSlotRecord>()
    }
}

/// The fixed-capacity aggregate of all channel and transform records plus
/// the shared window table and the free-slot count.
pub struct SharedStateRegion {
    layout: RegionLayout,
    mode: StorageMode,
    arena: Mutex<Vec<u32>>,
    /// Process-local snapshot of the window table for the processing path;
    /// the arena copy stays authoritative for cross-process readers.
    window: Arc<[f32]>,
}

fn record<T: Pod>(words: &[u32], off: usize) -> T {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    *bytemuck::from_bytes(&bytes[off..off + std::mem::size_of::<T>()])
}

fn record_mut<T: Pod>(words: &mut [u32], off: usize) -> &mut T {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(words);
    bytemuck::from_bytes_mut(&mut bytes[off..off + std::mem::size_of::<T>()])
}

impl SharedStateRegion {
    pub fn new(mode: StorageMode, rx_chans: usize, wf_chans: usize, window: &[f32]) -> Self {
        if mode == StorageMode::SharedSegment {
            info!("shared-segment storage selected; arena layout is segment-ready (process-local backing)");
        }
        let layout = RegionLayout::compute(rx_chans, wf_chans, window.len());
        let mut arena = vec![0u32; layout.total_bytes / 4];

        for slot in 0..wf_chans {
            let rec: &mut TransformSlotRecord = record_mut(&mut arena, layout.slot_at(slot));
            rec.bound_channel = -1;
        }
        {
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut arena);
            let dst: &mut [f32] = bytemuck::cast_slice_mut(
                &mut bytes[layout.window_off..layout.window_off + window.len() * 4],
            );
            dst.copy_from_slice(window);
        }
        *record_mut::<u32>(&mut arena, layout.free_off) = wf_chans as u32;

        Self {
            layout,
            mode,
            arena: Mutex::new(arena),
            window: Arc::from(window),
        }
    }

    /// Rebuild a region from relocated arena bytes. Records carry no
    /// pointers, so the copy is bit-faithful at every fixed offset.
    pub fn from_arena_bytes(mode: StorageMode, layout: RegionLayout, bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), layout.total_bytes);
        let arena: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        let window: Vec<f32> = {
            let raw: &[u8] = bytemuck::cast_slice(&arena);
            raw[layout.window_off..layout.window_off + layout.window_len * 4]
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
                .collect()
        };
        Self {
            layout,
            mode,
            arena: Mutex::new(arena),
            window: Arc::from(window.as_slice()),
        }
    }

    #[inline]
    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    #[inline]
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Shared window table used by every transform context.
    pub fn window_table(&self) -> Arc<[f32]> {
        Arc::clone(&self.window)
    }

    pub fn params(&self, chan: ChannelId) -> ChannelParamsRecord {
        let arena = self.arena.lock();
        record(&arena, self.layout.params_at(chan.index()))
    }

    pub fn with_params<R>(
        &self,
        chan: ChannelId,
        f: impl FnOnce(&mut ChannelParamsRecord) -> R,
    ) -> R {
        let mut arena = self.arena.lock();
        let off = self.layout.params_at(chan.index());
        f(record_mut(&mut arena, off))
    }

    pub fn slot(&self, slot: usize) -> TransformSlotRecord {
        let arena = self.arena.lock();
        record(&arena, self.layout.slot_at(slot))
    }

    pub fn free_slots(&self) -> u32 {
        let arena = self.arena.lock();
        record(&arena, self.layout.free_off)
    }

    /// Publish a channel's display parameters and emission state.
    pub fn publish_params(&self, chan: ChannelId, params: &DisplayParams, seq: u32, active: bool) {
        self.with_params(chan, |rec| {
            rec.start = params.start;
            rec.zoom = params.zoom;
            rec.plot_width = params.plot_width as u32;
            rec.mindb = params.mindb;
            rec.maxdb = params.maxdb;
            rec.flags = (params.compression as u32 * PARAMS_FLAG_COMPRESSION)
                | (active as u32 * PARAMS_FLAG_ACTIVE);
            rec.seq = seq;
            rec.nb_threshold = params.noise_blanker.threshold;
            rec.nb_click = params.noise_blanker.click;
            rec.last_pulse_ms = params.noise_blanker.last_pulse_ms;
        });
    }

    /// Publish a transform slot binding and maintain the free-slot count.
    pub fn publish_slot(
        &self,
        slot: usize,
        bound: Option<ChannelId>,
        fft_size: usize,
        plan_generation: u64,
    ) {
        let mut arena = self.arena.lock();
        let off = self.layout.slot_at(slot);
        let was_free = {
            let rec: &mut TransformSlotRecord = record_mut(&mut arena, off);
            let was_free = rec.bound_channel < 0;
            rec.bound_channel = bound.map_or(-1, |ch| ch.index() as i32);
            rec.fft_size = fft_size as u32;
            rec.plan_generation = plan_generation as u32;
            was_free
        };
        let now_free = bound.is_none();
        if was_free != now_free {
            let free: &mut u32 = record_mut(&mut arena, self.layout.free_off);
            if now_free {
                *free += 1;
            } else {
                assert!(*free > 0, "free-slot count underflow");
                *free -= 1;
            }
        }
    }

    /// Raw arena bytes, for segment export and the relocation tests.
    pub fn arena_bytes(&self) -> Vec<u8> {
        let arena = self.arena.lock();
        bytemuck::cast_slice(&arena).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wf::NoiseBlanker;

    fn test_region() -> SharedStateRegion {
        let window: Vec<f32> = (0..32).map(|i| i as f32 * 0.5).collect();
        SharedStateRegion::new(StorageMode::InProcess, 4, 2, &window)
    }

    #[test]
    fn layout_is_fixed_offset_and_word_aligned() {
        let layout = RegionLayout::compute(8, 4, 8192);
        assert_eq!(layout.params_off % 4, 0);
        assert_eq!(layout.slots_off % 4, 0);
        assert_eq!(layout.window_off % 4, 0);
        assert_eq!(layout.free_off % 4, 0);
        assert_eq!(layout.slots_off, 8 * std::mem::size_of::<ChannelParamsRecord>());
        assert_eq!(layout.total_bytes % 4, 0);
    }

    #[test]
    fn fresh_region_has_all_slots_free() {
        let region = test_region();
        assert_eq!(region.free_slots(), 2);
        assert_eq!(region.slot(0).bound_channel, -1);
        assert_eq!(region.slot(1).bound_channel, -1);
    }

    #[test]
    fn slot_publishing_maintains_free_count() {
        let region = test_region();
        region.publish_slot(0, Some(ChannelId::new(3)), 4096, 1);
        assert_eq!(region.free_slots(), 1);
        assert_eq!(region.slot(0).bound_channel, 3);
        // Re-publishing a bound slot must not double-count.
        region.publish_slot(0, Some(ChannelId::new(3)), 4096, 1);
        assert_eq!(region.free_slots(), 1);
        region.publish_slot(0, None, 4096, 1);
        assert_eq!(region.free_slots(), 2);
    }

    #[test]
    fn params_round_trip_through_the_arena() {
        let region = test_region();
        let params = DisplayParams {
            start: 512,
            zoom: 7,
            plot_width: 800,
            mindb: -150,
            maxdb: -30,
            compression: true,
            noise_blanker: NoiseBlanker {
                threshold: -40,
                click: 2,
                last_pulse_ms: 1234,
            },
        };
        region.publish_params(ChannelId::new(2), &params, 99, true);
        let rec = region.params(ChannelId::new(2));
        assert_eq!(rec.start, 512);
        assert_eq!(rec.zoom, 7);
        assert_eq!(rec.plot_width, 800);
        assert_eq!(rec.seq, 99);
        assert_eq!(rec.flags, PARAMS_FLAG_COMPRESSION | PARAMS_FLAG_ACTIVE);
        assert_eq!(rec.nb_threshold, -40);
        assert_eq!(rec.last_pulse_ms, 1234);
    }

    #[test]
    fn arena_relocates_byte_for_byte() {
        let region = test_region();
        region.publish_params(ChannelId::new(1), &DisplayParams::default(), 41, true);
        region.publish_slot(1, Some(ChannelId::new(1)), 8192, 3);

        let bytes = region.arena_bytes();
        let moved =
            SharedStateRegion::from_arena_bytes(StorageMode::SharedSegment, region.layout(), &bytes);

        assert_eq!(moved.params(ChannelId::new(1)), region.params(ChannelId::new(1)));
        assert_eq!(moved.slot(1), region.slot(1));
        assert_eq!(moved.free_slots(), region.free_slots());
        assert_eq!(moved.window_table().as_ref(), region.window_table().as_ref());
    }
}
