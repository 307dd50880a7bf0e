//! Flow control: overlapped-sampling detection and output pacing.
//!
//! Sample production can outrun transform-and-emit. When new blocks arrive
//! faster than the expected inter-block spacing, consecutive transform
//! windows are reusing raw samples ("overlapped sampling"); the monitor
//! marks the condition and favors the most recent window. Buffered output is
//! bounded at one row: replacing a pending row drops the stale one, keeping
//! at-most-one-row latency and fixed memory.

use crate::wf::NoiseBlanker;
use std::time::{Duration, Instant};
use tracing::debug;

/// A quantized pixel row waiting for emission, with the display parameters
/// it was computed under and the advisory noise-blanker metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedRow {
    pub pixels: Vec<u8>,
    pub start: u32,
    pub zoom: u32,
    pub noise_blanker: NoiseBlanker,
    pub captured: Instant,
}

/// Per-channel flow-control monitor.
#[derive(Debug)]
pub struct FlowControl {
    /// Expected spacing between sample blocks, `fft_used / sample_rate`.
    expected_spacing: Duration,
    /// Fractional undershoot of the expected spacing tolerated before the
    /// overlapped-sampling condition latches.
    tolerance: f32,
    check_overlapped_sampling: bool,
    overlapped_sampling: bool,
    last_arrival: Option<Instant>,
    last_emit: Option<Instant>,
    /// Time spent waiting for a sufficient sample block.
    samp_wait: Duration,
    /// Time spent waiting for per-chunk availability.
    chunk_wait: Duration,
    pending: Option<QuantizedRow>,
    flush_pending: u32,
    dropped_rows: u64,
}

impl FlowControl {
    pub fn new(tolerance: f32) -> Self {
        Self {
            expected_spacing: Duration::ZERO,
            tolerance: tolerance.clamp(0.0, 1.0),
            check_overlapped_sampling: false,
            overlapped_sampling: false,
            last_arrival: None,
            last_emit: None,
            samp_wait: Duration::ZERO,
            chunk_wait: Duration::ZERO,
            pending: None,
            flush_pending: 0,
            dropped_rows: 0,
        }
    }

    /// Derive the expected block spacing from the active transform size and
    /// sample rate. Enables overlap checking once spacing is known.
    pub fn set_expected_spacing(&mut self, fft_used: usize, sample_rate: f32) {
        if sample_rate > 0.0 && fft_used > 0 {
            self.expected_spacing = Duration::from_secs_f64(fft_used as f64 / sample_rate as f64);
            self.check_overlapped_sampling = true;
        } else {
            self.expected_spacing = Duration::ZERO;
            self.check_overlapped_sampling = false;
        }
        self.last_arrival = None;
        self.overlapped_sampling = false;
    }

    /// Record a sample-block arrival and update the overlapped-sampling
    /// condition from the measured spacing.
    pub fn note_arrival(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let measured = now.saturating_duration_since(last);
            self.samp_wait = measured;
            if self.check_overlapped_sampling {
                let floor = self.expected_spacing.mul_f32(1.0 - self.tolerance);
                let was = self.overlapped_sampling;
                self.overlapped_sampling = measured < floor;
                if self.overlapped_sampling != was {
                    debug!(
                        "overlapped sampling {}: measured {:?} expected {:?}",
                        if self.overlapped_sampling { "set" } else { "cleared" },
                        measured,
                        self.expected_spacing
                    );
                }
            }
        }
        self.last_arrival = Some(now);
    }

    /// Record time spent waiting for one chunk of samples within a block.
    pub fn note_chunk_wait(&mut self, wait: Duration) {
        self.chunk_wait = wait;
    }

    /// Offer a freshly quantized row. Returns the row to emit now, if any.
    ///
    /// A pending flush or an on-pace pipeline emits immediately. When the
    /// channel is falling behind, the newest row replaces any buffered one
    /// (oldest dropped) and emission waits for the next pacing slot.
    pub fn submit(&mut self, row: QuantizedRow, now: Instant) -> Option<QuantizedRow> {
        if self.flush_pending > 0 {
            self.flush_pending -= 1;
            if self.pending.take().is_some() {
                self.dropped_rows += 1;
            }
            return self.emit(row, now);
        }

        let paced_out = match self.last_emit {
            Some(last) if self.overlapped_sampling => {
                now.saturating_duration_since(last) < self.expected_spacing
            }
            _ => false,
        };

        if paced_out {
            if self.pending.replace(row).is_some() {
                self.dropped_rows += 1;
                debug!("coalesced stale row ({} dropped total)", self.dropped_rows);
            }
            return None;
        }

        // Favor the most recent window: anything still buffered is stale.
        if self.pending.take().is_some() {
            self.dropped_rows += 1;
        }
        self.emit(row, now)
    }

    /// Emit the buffered row if its pacing slot has arrived.
    pub fn take_ready(&mut self, now: Instant) -> Option<QuantizedRow> {
        let due = match (self.pending.as_ref(), self.last_emit) {
            (Some(_), Some(last)) => now.saturating_duration_since(last) >= self.expected_spacing,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if due {
            let row = self.pending.take();
            self.last_emit = Some(now);
            row
        } else {
            None
        }
    }

    /// Discard any buffered-but-unsent row and force the next submitted row
    /// to emit immediately: stale pixels after a parameter change are worse
    /// than a brief gap.
    pub fn flush(&mut self) {
        if self.pending.take().is_some() {
            self.dropped_rows += 1;
        }
        self.flush_pending = self.flush_pending.saturating_add(1);
    }

    #[inline]
    pub fn overlapped_sampling(&self) -> bool {
        self.overlapped_sampling
    }

    #[inline]
    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows
    }

    #[inline]
    pub fn samp_wait(&self) -> Duration {
        self.samp_wait
    }

    #[inline]
    pub fn chunk_wait(&self) -> Duration {
        self.chunk_wait
    }

    fn emit(&mut self, row: QuantizedRow, now: Instant) -> Option<QuantizedRow> {
        self.last_emit = Some(now);
        Some(row)
    }
}
