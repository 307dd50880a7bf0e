//! Per-channel waterfall state machine.
//!
//! `Inactive → Active → Stopping → Inactive`. Activation borrows a transform
//! context from the shared pool and computes the initial bin↔pixel map;
//! every subsequent sample block is accumulated, transformed, mapped,
//! quantized, and offered to flow control, which decides whether the row
//! emits now, coalesces, or waits for its pacing slot. Stop requests are
//! honored at the next processing slot, releasing the context synchronously
//! before the channel goes inactive.

use crate::dsp::transform::{PoolExhausted, TransformContext, TransformPool};
use crate::dsp::window::coherent_gain;
use crate::dsp::zoom::{MapCache, ZoomKey};
use crate::dsp::{ProcessorUpdate, SampleBlock, SampleProcessor};
use crate::net::packet::{quantize_db, OutputPacket, PacketEncoder};
use crate::wf::flow::{FlowControl, QuantizedRow};
use crate::wf::shmem::SharedStateRegion;
use crate::wf::{ChannelId, DisplayParams, WF_USING_HALF_FFT};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const LOG_FACTOR: f32 = 10.0 * core::f32::consts::LOG10_E;
const POWER_EPSILON: f32 = 1.0e-30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Inactive,
    Active,
    Stopping,
}

pub struct WaterfallChannel {
    id: ChannelId,
    state: ChannelState,
    params: DisplayParams,
    /// Transform length in use while active; usable bins are half of it.
    fft_used: usize,
    pool: Arc<TransformPool>,
    region: Arc<SharedStateRegion>,
    window: Arc<[f32]>,
    /// Amplitude normalization derived from the window's coherent gain.
    fft_scale: f32,
    ctx: Option<Box<TransformContext>>,
    /// Rate the expected block spacing was last derived from.
    sample_rate: f32,
    maps: MapCache,
    flow: FlowControl,
    encoder: PacketEncoder,
    dropped_samples: u64,
}

impl WaterfallChannel {
    pub fn new(
        id: ChannelId,
        pool: Arc<TransformPool>,
        region: Arc<SharedStateRegion>,
        params: DisplayParams,
        fft_used: usize,
        overlap_tolerance: f32,
    ) -> Self {
        assert!(
            fft_used > 0 && fft_used <= pool.worst_case_nfft(),
            "fft_used {fft_used} exceeds pool worst case"
        );
        let window = region.window_table();
        assert!(
            window.len() >= fft_used,
            "window table shorter than transform"
        );
        let gain = coherent_gain(&window[..fft_used]);

        Self {
            id,
            state: ChannelState::Inactive,
            params: params.clamped(),
            fft_used,
            pool,
            region,
            fft_scale: 1.0 / (gain * gain),
            window,
            ctx: None,
            sample_rate: 0.0,
            maps: MapCache::default(),
            flow: FlowControl::new(overlap_tolerance),
            encoder: PacketEncoder::new(),
            dropped_samples: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn params(&self) -> DisplayParams {
        self.params
    }

    #[inline]
    pub fn usable_bins(&self) -> usize {
        self.fft_used / WF_USING_HALF_FFT
    }

    #[inline]
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    #[inline]
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// First display request from a connected client: borrow a transform
    /// context and compute the initial map. On exhaustion the channel stays
    /// inactive and the condition is reported to the caller.
    ///
    /// A reconnect racing an unhonored stop request finds the context still
    /// bound; it is reused with its buffered samples discarded, never
    /// shadowed by a second acquisition.
    pub fn activate(&mut self, sample_rate: f32) -> Result<(), PoolExhausted> {
        if self.state == ChannelState::Active {
            return Ok(());
        }
        let ctx = match self.ctx.take() {
            Some(mut ctx) => {
                ctx.discard_pending();
                ctx
            }
            None => match self.pool.acquire(self.id, self.fft_used) {
                Ok(ctx) => ctx,
                Err(err) => {
                    warn!("{}: display stays inactive: {err}", self.id);
                    return Err(err);
                }
            },
        };
        self.region
            .publish_slot(ctx.slot(), Some(self.id), ctx.fft_size(), ctx.plan_generation());
        self.ctx = Some(ctx);

        self.maps.invalidate();
        self.ensure_map();
        self.sample_rate = sample_rate;
        self.flow.set_expected_spacing(self.fft_used, sample_rate);
        self.state = ChannelState::Active;
        self.publish();
        info!("{}: waterfall active, fft {} bins", self.id, self.fft_used);
        Ok(())
    }

    /// Ask the channel to stop; honored at its next processing slot.
    pub fn request_stop(&mut self) {
        if self.state == ChannelState::Active {
            self.state = ChannelState::Stopping;
        }
    }

    /// Client disconnect: release the transform context immediately.
    pub fn stop(&mut self) {
        self.release_context();
        self.state = ChannelState::Inactive;
        self.publish();
        info!("{}: waterfall inactive", self.id);
    }

    /// Control-surface mutation of the display parameters. A pan, zoom, or
    /// width change flushes any buffered row so stale pixels never follow a
    /// parameter change onto the wire.
    pub fn set_params(&mut self, params: DisplayParams) {
        let params = params.clamped();
        let view_changed = params.start != self.params.start
            || params.zoom != self.params.zoom
            || params.plot_width != self.params.plot_width;
        self.params = params;
        if view_changed {
            debug!(
                "{}: view change start={} zoom={} width={}",
                self.id, params.start, params.zoom, params.plot_width
            );
            self.flow.flush();
        }
        self.publish();
    }

    fn ensure_map(&mut self) -> bool {
        let key = ZoomKey {
            start: self.params.start,
            zoom: self.params.zoom,
            plot_width: self.params.plot_width,
        };
        let usable = self.fft_used / WF_USING_HALF_FFT;
        let (_, recomputed) = self.maps.ensure(key, usable);
        recomputed
    }

    fn release_context(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.region
                .publish_slot(ctx.slot(), None, ctx.fft_size(), ctx.plan_generation());
            self.pool.release(ctx);
        }
    }

    fn publish(&self) {
        self.region.publish_params(
            self.id,
            &self.params,
            self.encoder.next_seq(),
            self.state == ChannelState::Active,
        );
    }

    /// Quantize the freshest spectrum into a pixel row using the inverse
    /// map: one representative bin looked up per output pixel.
    fn quantize_row(&mut self, now: Instant) -> QuantizedRow {
        if self.ensure_map() {
            debug!("{}: mapping recomputed", self.id);
        }
        let ctx = self.ctx.as_mut().expect("active channel owns a context");
        let spectrum = ctx.run(&self.window[..self.fft_used]);

        let map = self.maps.current().expect("map computed above");
        let mindb = self.params.mindb;
        let maxdb = self.params.maxdb;
        let scale = self.fft_scale;
        let pixels: Vec<u8> = map
            .inverse()
            .iter()
            .map(|&bin| {
                let power = (spectrum[bin as usize].norm_sqr() * scale).max(POWER_EPSILON);
                quantize_db(power.ln() * LOG_FACTOR, mindb, maxdb)
            })
            .collect();

        QuantizedRow {
            pixels,
            start: map.start(),
            zoom: self.params.zoom,
            noise_blanker: self.params.noise_blanker,
            captured: now,
        }
    }

    fn emit(&mut self, row: QuantizedRow, out: &mut Vec<OutputPacket>) {
        let packet = self
            .encoder
            .encode(self.id, &row, self.params.compression);
        self.region.with_params(self.id, |rec| rec.seq = packet.seq);
        out.push(packet);
    }
}

impl SampleProcessor for WaterfallChannel {
    type Output = Vec<OutputPacket>;

    fn process_block(&mut self, block: &SampleBlock<'_>) -> ProcessorUpdate<Self::Output> {
        debug_assert_eq!(block.channel, self.id, "block routed to wrong channel");
        match self.state {
            ChannelState::Inactive => return ProcessorUpdate::None,
            ChannelState::Stopping => {
                self.stop();
                return ProcessorUpdate::None;
            }
            ChannelState::Active => {}
        }

        // A producing-stage rate change invalidates the expected block
        // spacing and any overlap measured against it.
        if block.sample_rate > 0.0 && block.sample_rate != self.sample_rate {
            self.sample_rate = block.sample_rate;
            self.flow.set_expected_spacing(self.fft_used, block.sample_rate);
        }

        let now = block.timestamp;
        self.flow.note_arrival(now);

        let ctx = self.ctx.as_mut().expect("active channel owns a context");
        let shed = ctx.push(block.samples);
        if shed > 0 {
            self.dropped_samples += shed as u64;
            debug!("{}: shed {shed} samples, producer outrunning transform", self.id);
        }

        let mut packets = Vec::new();
        while self.ctx.as_ref().is_some_and(|c| c.ready()) {
            let row = self.quantize_row(now);
            if let Some(ready) = self.flow.submit(row, now) {
                self.emit(ready, &mut packets);
            }
        }
        if let Some(ready) = self.flow.take_ready(now) {
            self.emit(ready, &mut packets);
        }

        if packets.is_empty() {
            ProcessorUpdate::None
        } else {
            ProcessorUpdate::Snapshot(packets)
        }
    }

    fn reset(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.discard_pending();
        }
        self.flow.flush();
    }
}

impl Drop for WaterfallChannel {
    fn drop(&mut self) {
        self.release_context();
    }
}
