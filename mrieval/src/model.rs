//! The model contract used by the evaluation loop, and the recorded-output model.
//!
//! Networks are trained and run in an external framework. What this crate
//! needs from one is narrow: given a batch of k-space inputs, a reconstructed
//! image per sample and, for adaptive models, the probability masks its
//! sampling policy produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use burn::prelude::*;

use crate::checkpoint::{self, Checkpoint, ModelVariant};
use crate::data::{to_tensor, Batch};
use crate::record::{self, SampleRecord};

/// Auxiliary outputs of a forward pass.
#[derive(Debug, Clone)]
pub struct ExtraOutputs<B: Backend> {
    /// One `[B, 1, 1, L, 1]` probability mask per sampling policy.
    pub prob_masks: Option<Vec<Tensor<B, 5>>>,
}

impl<B: Backend> Default for ExtraOutputs<B> {
    fn default() -> Self {
        Self { prob_masks: None }
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Reconstructed images `[B, H, W]`.
    pub reconstruction: Tensor<B, 3>,
    pub extra: ExtraOutputs<B>,
}

/// A reconstruction model as seen by the evaluation loop.
pub trait ReconModel<B: Backend> {
    /// Run inference on one batch. Implementations read `kspace`,
    /// `masked_kspace` and `mask`; the sample identifiers are available
    /// for models that need them.
    fn forward(&mut self, batch: &Batch<B>) -> Result<ModelOutput<B>>;

    /// Number of lines the sampling policy acquires, for adaptive models.
    fn budget(&self) -> Option<usize>;

    fn variant(&self) -> ModelVariant;
}

/// Replays reconstructions (and policy masks) recorded for a checkpoint.
///
/// Outputs are `.mrs` records holding `reconstruction [H, W]` and, for
/// adaptive checkpoints, `prob_mask [L]`, keyed by file name and slice.
pub struct RecordedModel<B: Backend> {
    variant: ModelVariant,
    budget: Option<usize>,
    outputs: HashMap<(String, u32), SampleRecord>,
    device: B::Device,
}

impl<B: Backend> std::fmt::Debug for RecordedModel<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordedModel")
            .field("variant", &self.variant)
            .field("budget", &self.budget)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl<B: Backend> RecordedModel<B> {
    /// Resolve the checkpoint variant and index its recorded outputs.
    ///
    /// `outputs_dir` defaults to `outputs/` next to the checkpoint manifest.
    pub fn load(checkpoint_path: &Path, outputs_dir: Option<&Path>, device: B::Device) -> Result<Self> {
        eprintln!("loading model from {}", checkpoint_path.display());
        let ckpt = Checkpoint::load(checkpoint_path)?;
        let variant = ckpt.resolve_variant()?;
        let budget = if variant.has_policy() { ckpt.budget() } else { None };

        let outputs_dir: PathBuf = match outputs_dir {
            Some(dir) => dir.to_path_buf(),
            None => checkpoint::checkpoint_dir(checkpoint_path).join("outputs"),
        };

        let mut outputs = HashMap::new();
        for path in record::collect_records(&outputs_dir)? {
            let rec = SampleRecord::read(&path)?;
            rec.array("reconstruction")?;
            if rec.arrays.contains_key("prob_mask") && !variant.has_policy() {
                bail!(
                    "{}: recorded prob_mask, but the checkpoint is a {variant} without a sampling policy",
                    path.display()
                );
            }
            outputs.insert((rec.fname.clone(), rec.slice_num), rec);
        }
        ensure!(
            !outputs.is_empty(),
            "no recorded outputs found in {}",
            outputs_dir.display()
        );
        log::info!(
            "{variant} (budget {budget:?}) with {} recorded slices, {} parameters",
            outputs.len(),
            ckpt.num_parameters()
        );

        Ok(Self {
            variant,
            budget,
            outputs,
            device,
        })
    }

    fn lookup(&self, fname: &str, slice_num: u32) -> Result<&SampleRecord> {
        self.outputs
            .get(&(fname.to_string(), slice_num))
            .with_context(|| format!("no recorded output for {fname} slice {slice_num}"))
    }
}

impl<B: Backend> ReconModel<B> for RecordedModel<B> {
    fn forward(&mut self, batch: &Batch<B>) -> Result<ModelOutput<B>> {
        let [_, _, _, width, _] = batch.mask.dims();

        let mut images = Vec::with_capacity(batch.len());
        let mut masks = Vec::with_capacity(batch.len());
        for (fname, &slice_num) in batch.fnames.iter().zip(&batch.slice_nums) {
            let rec = self.lookup(fname, slice_num)?;

            let image = rec.array("reconstruction")?;
            ensure!(
                image.shape.len() == 2,
                "{fname} slice {slice_num}: reconstruction must be [H, W], got {:?}",
                image.shape
            );
            images.push(to_tensor::<B, 2>(image, &self.device));

            if self.variant.has_policy() {
                let mask = rec.array("prob_mask")?;
                ensure!(
                    mask.shape == [width],
                    "{fname} slice {slice_num}: prob_mask must have {width} lines, got {:?}",
                    mask.shape
                );
                masks.push(to_tensor::<B, 1>(mask, &self.device).reshape([1, 1, width, 1]));
            }
        }

        let prob_masks = if masks.is_empty() {
            None
        } else {
            Some(vec![Tensor::stack(masks, 0)])
        };

        Ok(ModelOutput {
            reconstruction: Tensor::stack(images, 0),
            extra: ExtraOutputs { prob_masks },
        })
    }

    fn budget(&self) -> Option<usize> {
        self.budget
    }

    fn variant(&self) -> ModelVariant {
        self.variant
    }
}
