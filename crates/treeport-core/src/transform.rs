//! Output transformation applied by engines when margin mode is off.

use serde::{Deserialize, Serialize};

/// How raw margins become the engine's default predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Postprocessor {
    /// Output = margin.
    #[default]
    Identity,
    /// Output = 1 / (1 + exp(-alpha * margin)).
    Sigmoid,
    /// Row-wise softmax over the output columns.
    Softmax,
    /// Output = exp(margin).
    Exponential,
}

impl Postprocessor {
    /// Apply in place to a row-major `(rows, width)` buffer.
    ///
    /// # Panics
    ///
    /// Panics if `width` is 0 or does not divide `predictions.len()`.
    pub fn transform_inplace(&self, predictions: &mut [f32], width: usize, sigmoid_alpha: f32) {
        assert!(width > 0, "width must be > 0");
        assert!(
            predictions.len().is_multiple_of(width),
            "predictions.len() must be divisible by width"
        );

        match self {
            Postprocessor::Identity => {}
            Postprocessor::Sigmoid => {
                for x in predictions.iter_mut() {
                    *x = sigmoid(sigmoid_alpha * *x);
                }
            }
            Postprocessor::Softmax => {
                for row in predictions.chunks_exact_mut(width) {
                    softmax_inplace(row);
                }
            }
            Postprocessor::Exponential => {
                for x in predictions.iter_mut() {
                    *x = x.exp();
                }
            }
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    let clamped = x.clamp(-500.0, 500.0);
    if clamped >= 0.0 {
        1.0 / (1.0 + (-clamped).exp())
    } else {
        let e = clamped.exp();
        e / (1.0 + e)
    }
}

#[inline]
fn softmax_inplace(row: &mut [f32]) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }

    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
}
