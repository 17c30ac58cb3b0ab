//! K-space undersampling masks.
//!
//! Masks select phase-encoding columns of k-space. Every mask keeps a fully
//! sampled band of low frequencies around the center and adds higher
//! frequencies according to the mask type. Randomness is seeded per file from
//! the run seed and the file name, so a slice always sees the same mask.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::config::{MaskConfig, MaskType};

/// Builds undersampling masks from a [`MaskConfig`].
#[derive(Debug, Clone)]
pub struct MaskFunc {
    config: MaskConfig,
    seed: u64,
}

impl MaskFunc {
    pub fn new(config: MaskConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn config(&self) -> &MaskConfig {
        &self.config
    }

    /// RNG for one file, derived from the run seed and a hash of the file name.
    fn rng_for(&self, fname: &str) -> StdRng {
        let digest = Sha256::digest(fname.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        StdRng::seed_from_u64(self.seed ^ u64::from_be_bytes(word))
    }

    /// Column mask of length `num_cols` with 1.0 for sampled columns.
    pub fn sample_mask(&self, num_cols: usize, fname: &str) -> Vec<f32> {
        let mut rng = self.rng_for(fname);

        let choice = rng.gen_range(0..self.config.center_fractions.len());
        let center_fraction = self.config.center_fractions[choice];
        let acceleration = self.config.accelerations[choice] as f64;

        let num_low = ((num_cols as f64 * center_fraction).round() as usize).min(num_cols);
        let pad = (num_cols - num_low + 1) / 2;
        let center = pad..pad + num_low;

        let mut mask = vec![0f32; num_cols];
        for m in &mut mask[center.clone()] {
            *m = 1.0;
        }

        match self.config.mask_type {
            MaskType::Random => {
                let outside = (num_cols - num_low) as f64;
                let prob = if outside > 0.0 {
                    ((num_cols as f64 / acceleration - num_low as f64) / outside).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                for (col, m) in mask.iter_mut().enumerate() {
                    let draw: f64 = rng.gen();
                    if !center.contains(&col) && draw < prob {
                        *m = 1.0;
                    }
                }
            }
            MaskType::EquispacedFraction => {
                let denom = num_low as f64 * acceleration - num_cols as f64;
                let adjusted = if denom.abs() > f64::EPSILON {
                    acceleration * (num_low as f64 - num_cols as f64) / denom
                } else {
                    acceleration
                };
                let adjusted = if adjusted.is_finite() && adjusted >= 1.0 {
                    adjusted
                } else {
                    acceleration
                };
                let offset = rng.gen_range(0..(adjusted.round() as usize).max(1)) as f64;
                let mut pos = offset;
                while pos < (num_cols - 1) as f64 {
                    let col = pos.round() as usize;
                    if col < num_cols {
                        mask[col] = 1.0;
                    }
                    pos += adjusted;
                }
            }
            MaskType::AdaptiveEquispacedFraction => {
                let step = (acceleration.round() as usize).max(1);
                let offset = rng.gen_range(0..step);
                let candidates: Vec<usize> = if self.config.skip_low_freqs {
                    (0..num_cols).filter(|c| !center.contains(c)).collect()
                } else {
                    (0..num_cols).collect()
                };
                for &col in candidates.iter().skip(offset).step_by(step) {
                    mask[col] = 1.0;
                }
            }
        }

        log::trace!(
            "{fname}: {} mask cf={center_fraction} acc={acceleration}, {} of {num_cols} lines",
            self.config.mask_type,
            mask.iter().filter(|&&m| m > 0.0).count()
        );
        mask
    }
}

/// Undersample one slice of k-space `[C, H, W, 2]` with a column mask.
///
/// Returns the masked k-space and the mask shaped `[1, 1, W, 1]`.
pub fn apply_mask<B: Backend>(kspace: Tensor<B, 4>, columns: &[f32]) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [c, h, w, two] = kspace.dims();
    let mask = Tensor::<B, 1>::from_floats(columns, &kspace.device()).reshape([1, 1, w, 1]);
    // + 0.0 turns the -0.0 of masked negative entries into 0.0
    let masked = kspace * mask.clone().expand([c, h, w, two]) + 0.0;
    (masked, mask)
}
