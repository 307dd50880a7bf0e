//! Sample-block contracts shared by the waterfall pipeline.
//!
//! The scheduler substrate is external: it hands each channel's processing
//! unit a block of samples whenever one is available. [`SampleProcessor`] is
//! that unit of work; tests drive it directly with synthetic blocks.

pub mod transform;
pub mod window;
pub mod zoom;

use crate::wf::ChannelId;
use rustfft::num_complex::Complex32;
use std::time::Instant;

/// Which decimation/filtering stage produced a sample block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleStage {
    PreFilter,
    PostFilter,
}

/// Borrowed sample payload, complex IQ or real.
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    Complex(&'a [Complex32]),
    Real(&'a [f32]),
}

impl Samples<'_> {
    pub fn len(&self) -> usize {
        match self {
            Samples::Complex(s) => s.len(),
            Samples::Real(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A block of samples delivered by the sample-source layer for one channel.
#[derive(Debug, Clone, Copy)]
pub struct SampleBlock<'a> {
    pub channel: ChannelId,
    pub stage: SampleStage,
    pub samples: Samples<'a>,
    /// Sample-rate of the producing stage in Hz.
    pub sample_rate: f32,
    /// Arrival timestamp, used by flow control to measure block spacing.
    pub timestamp: Instant,
}

/// Output emitted by a processor after consuming a [`SampleBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorUpdate<T> {
    /// No new result is ready for downstream consumers.
    None,
    /// A fresh snapshot is available.
    Snapshot(T),
}

/// The unit of work the external cooperative scheduler drives. Processing
/// runs to completion without suspending; the only wait points are between
/// invocations.
pub trait SampleProcessor {
    type Output;

    fn process_block(&mut self, block: &SampleBlock<'_>) -> ProcessorUpdate<Self::Output>;

    /// Reset accumulated state, discarding partial sample windows.
    fn reset(&mut self);
}
