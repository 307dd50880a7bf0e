//! Window functions for the transform contexts.
//!
//! One table is precomputed at region construction and shared by every
//! context; contexts never compute coefficients on the processing path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        match self {
            WindowKind::Rectangular => vec![1.0; len],
            WindowKind::Hann => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.5 * (1.0 - phase.cos())
                })
                .collect(),
            WindowKind::Hamming => (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    0.54 - 0.46 * phase.cos()
                })
                .collect(),
            WindowKind::Blackman => {
                let a0 = 0.42;
                let a1 = 0.5;
                let a2 = 0.08;
                (0..len)
                    .map(|n| {
                        let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                        a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
                    })
                    .collect()
            }
        }
    }
}

/// Sum of the coefficients, used for amplitude normalization of the FFT
/// output so quantized dB values stay window-independent.
pub fn coherent_gain(window: &[f32]) -> f32 {
    let sum: f32 = window.iter().sum();
    if sum.is_finite() && sum.abs() > f32::EPSILON {
        sum
    } else {
        window.len().max(1) as f32
    }
}
