//! Transform resource pool.
//!
//! A bounded set of heavy FFT contexts (plan + sample/spectrum buffers) is
//! shared by a larger number of receiver channels. A context is bound to at
//! most one channel at a time; binding hands the context out by value, so
//! exclusivity is enforced by ownership and the pool lock only arbitrates
//! acquire/release.

use crate::dsp::Samples;
use crate::wf::ChannelId;
use parking_lot::Mutex;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// All transform contexts are bound; the requesting channel must stay
/// inactive until a slot frees. Reported, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted {
    pub channel: ChannelId,
}

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no free transform context for {}", self.channel)
    }
}

impl std::error::Error for PoolExhausted {}

/// One FFT execution context: plan sized for the currently bound transform
/// length, plus pre-allocated sample and spectrum buffers sized for the
/// worst case. The buffers never grow after construction.
pub struct TransformContext {
    slot: usize,
    fft_size: usize,
    plan: Arc<dyn Fft<f32>>,
    plan_generation: u64,
    samps: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    filled: usize,
}

impl TransformContext {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Increments once per plan construction; unchanged generation across a
    /// release/re-acquire proves the heavy plan was reused.
    #[inline]
    pub fn plan_generation(&self) -> u64 {
        self.plan_generation
    }

    /// Number of buffered samples not yet consumed by a transform.
    #[inline]
    pub fn pending(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn ready(&self) -> bool {
        self.filled >= self.fft_size
    }

    /// Append samples, widening real input to complex with zero imaginary
    /// parts. Returns the number of samples dropped once the fixed buffer is
    /// full; the flow-control monitor accounts for them.
    pub fn push(&mut self, samples: Samples<'_>) -> usize {
        let capacity = self.samps.len();
        let room = capacity - self.filled;
        match samples {
            Samples::Complex(src) => {
                let take = src.len().min(room);
                self.samps[self.filled..self.filled + take].copy_from_slice(&src[..take]);
                self.filled += take;
                src.len() - take
            }
            Samples::Real(src) => {
                let take = src.len().min(room);
                for (dst, &re) in self.samps[self.filled..self.filled + take]
                    .iter_mut()
                    .zip(src)
                {
                    *dst = Complex32::new(re, 0.0);
                }
                self.filled += take;
                src.len() - take
            }
        }
    }

    /// Run one windowed transform over the oldest `fft_size` buffered
    /// samples, consume them, and return the complex spectrum.
    ///
    /// Panics if fewer than `fft_size` samples are buffered: callers gate on
    /// [`ready`](Self::ready), so running early is a programming error.
    pub fn run(&mut self, window: &[f32]) -> &[Complex32] {
        assert!(
            self.filled >= self.fft_size,
            "transform run with {} of {} samples buffered",
            self.filled,
            self.fft_size
        );
        let n = self.fft_size;
        for (dst, (&s, &w)) in self.spectrum[..n]
            .iter_mut()
            .zip(self.samps[..n].iter().zip(&window[..n]))
        {
            *dst = s * w;
        }
        self.plan
            .process_with_scratch(&mut self.spectrum[..n], &mut self.scratch);

        self.samps.copy_within(n..self.filled, 0);
        self.filled -= n;
        &self.spectrum[..n]
    }

    /// Discard buffered samples without transforming them.
    pub fn discard_pending(&mut self) {
        self.filled = 0;
    }
}

impl fmt::Debug for TransformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformContext")
            .field("slot", &self.slot)
            .field("fft_size", &self.fft_size)
            .field("plan_generation", &self.plan_generation)
            .field("filled", &self.filled)
            .finish_non_exhaustive()
    }
}

enum SlotState {
    Free(Box<TransformContext>),
    Bound(ChannelId),
}

struct PoolInner {
    planner: FftPlanner<f32>,
    slots: Vec<SlotState>,
    plan_generation: u64,
}

impl PoolInner {
    fn replan(&mut self, ctx: &mut TransformContext, fft_size: usize) {
        self.plan_generation += 1;
        ctx.plan = self.planner.plan_fft_forward(fft_size);
        ctx.fft_size = fft_size;
        ctx.plan_generation = self.plan_generation;
        ctx.scratch
            .resize(ctx.plan.get_inplace_scratch_len(), Complex32::default());
        ctx.filled = 0;
    }
}

/// Fixed pool of [`TransformContext`]s, fewer than the receiver-channel
/// count. The mutex makes binding atomic with respect to other channels'
/// binding attempts; bound contexts are touched by their owner only.
pub struct TransformPool {
    inner: Mutex<PoolInner>,
    worst_case_nfft: usize,
}

impl TransformPool {
    pub fn new(slots: usize, worst_case_nfft: usize) -> Self {
        assert!(slots > 0, "transform pool needs at least one slot");
        assert!(worst_case_nfft > 0);
        let mut planner = FftPlanner::new();
        let plan = planner.plan_fft_forward(worst_case_nfft);
        let scratch_len = plan.get_inplace_scratch_len();

        let slots = (0..slots)
            .map(|slot| {
                SlotState::Free(Box::new(TransformContext {
                    slot,
                    fft_size: worst_case_nfft,
                    plan: Arc::clone(&plan),
                    plan_generation: 0,
                    samps: vec![Complex32::default(); worst_case_nfft],
                    spectrum: vec![Complex32::default(); worst_case_nfft],
                    scratch: vec![Complex32::default(); scratch_len],
                    filled: 0,
                }))
            })
            .collect();

        Self {
            inner: Mutex::new(PoolInner {
                planner,
                slots,
                plan_generation: 0,
            }),
            worst_case_nfft,
        }
    }

    #[inline]
    pub fn worst_case_nfft(&self) -> usize {
        self.worst_case_nfft
    }

    /// Bind a free context to `channel`, replanning only when the requested
    /// transform length differs from what the context last ran.
    pub fn acquire(
        &self,
        channel: ChannelId,
        fft_size: usize,
    ) -> Result<Box<TransformContext>, PoolExhausted> {
        assert!(
            fft_size > 0 && fft_size <= self.worst_case_nfft,
            "fft size {fft_size} exceeds worst case {}",
            self.worst_case_nfft
        );
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter()
            .position(|s| matches!(s, SlotState::Free(_)))
            .ok_or(PoolExhausted { channel })?;

        let state = std::mem::replace(&mut inner.slots[slot], SlotState::Bound(channel));
        let mut ctx = match state {
            SlotState::Free(ctx) => ctx,
            SlotState::Bound(_) => unreachable!("slot selected as free"),
        };
        if ctx.fft_size != fft_size {
            inner.replan(&mut ctx, fft_size);
        } else {
            ctx.filled = 0;
        }
        Ok(ctx)
    }

    /// Return a context to the pool. The plan is retained so a later
    /// acquisition with the same transform length skips replanning.
    pub fn release(&self, ctx: Box<TransformContext>) {
        let mut inner = self.inner.lock();
        let slot = ctx.slot;
        debug_assert!(matches!(inner.slots[slot], SlotState::Bound(_)));
        inner.slots[slot] = SlotState::Free(ctx);
    }

    /// Rebuild the plan of a bound context for a new transform length.
    /// No-op when the length is unchanged.
    pub fn reconfigure(&self, ctx: &mut TransformContext, fft_size: usize) {
        assert!(fft_size > 0 && fft_size <= self.worst_case_nfft);
        if ctx.fft_size == fft_size {
            return;
        }
        let mut inner = self.inner.lock();
        inner.replan(ctx, fft_size);
    }

    pub fn available(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s, SlotState::Free(_)))
            .count()
    }

    /// Channel currently bound to each slot, `None` for free slots.
    pub fn bindings(&self) -> Vec<Option<ChannelId>> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|s| match s {
                SlotState::Free(_) => None,
                SlotState::Bound(ch) => Some(*ch),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(i: usize) -> ChannelId {
        ChannelId::new(i)
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let pool = TransformPool::new(2, 256);
        let a = pool.acquire(ch(0), 256).unwrap();
        let b = pool.acquire(ch(1), 256).unwrap();
        let err = pool.acquire(ch(2), 256).unwrap_err();
        assert_eq!(err.channel, ch(2));
        assert_eq!(pool.available(), 0);
        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire(ch(2), 256).is_ok());
        pool.release(b);
    }

    #[test]
    fn context_debug_reports_binding_not_buffers() {
        let pool = TransformPool::new(1, 16);
        let ctx = pool.acquire(ch(0), 16).unwrap();
        let rendered = format!("{ctx:?}");
        assert!(rendered.contains("slot"));
        assert!(rendered.contains("fft_size"));
        pool.release(ctx);
    }

    #[test]
    fn bindings_are_exclusive() {
        let pool = TransformPool::new(2, 128);
        let a = pool.acquire(ch(0), 128).unwrap();
        let b = pool.acquire(ch(1), 128).unwrap();
        assert_ne!(a.slot(), b.slot());
        let bound = pool.bindings();
        assert!(bound.contains(&Some(ch(0))) && bound.contains(&Some(ch(1))));
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn plan_reused_when_size_unchanged() {
        let pool = TransformPool::new(1, 512);
        let a = pool.acquire(ch(0), 512).unwrap();
        let gen = a.plan_generation();
        pool.release(a);
        let b = pool.acquire(ch(0), 512).unwrap();
        assert_eq!(b.plan_generation(), gen);
        pool.release(b);
    }

    #[test]
    fn size_change_replans_one_context() {
        let pool = TransformPool::new(1, 512);
        let mut a = pool.acquire(ch(0), 512).unwrap();
        let gen = a.plan_generation();
        pool.reconfigure(&mut a, 256);
        assert_eq!(a.fft_size(), 256);
        assert!(a.plan_generation() > gen);
        pool.reconfigure(&mut a, 256);
        assert_eq!(a.fft_size(), 256);
        pool.release(a);
    }

    #[test]
    fn tone_lands_in_expected_bin() {
        let n = 64;
        let pool = TransformPool::new(1, n);
        let mut ctx = pool.acquire(ch(0), n).unwrap();
        let bin = 5;
        let tone: Vec<Complex32> = (0..n)
            .map(|i| {
                let phase = core::f32::consts::TAU * bin as f32 * i as f32 / n as f32;
                Complex32::new(phase.cos(), phase.sin())
            })
            .collect();
        assert_eq!(ctx.push(Samples::Complex(&tone)), 0);
        assert!(ctx.ready());
        let window = vec![1.0f32; n];
        let spectrum = ctx.run(&window);
        let peak = (0..n)
            .max_by(|&a, &b| {
                spectrum[a]
                    .norm_sqr()
                    .partial_cmp(&spectrum[b].norm_sqr())
                    .unwrap()
            })
            .unwrap();
        assert_eq!(peak, bin);
        assert_eq!(ctx.pending(), 0);
        pool.release(ctx);
    }

    #[test]
    fn push_drops_overflow_and_reports_it() {
        let pool = TransformPool::new(1, 16);
        let mut ctx = pool.acquire(ch(0), 16).unwrap();
        let block = vec![0.0f32; 24];
        assert_eq!(ctx.push(Samples::Real(&block)), 8);
        assert_eq!(ctx.pending(), 16);
        pool.release(ctx);
    }
}
