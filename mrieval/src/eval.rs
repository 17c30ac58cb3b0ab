//! Evaluation loop: runs a model over a data source and aggregates metrics.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, ensure, Result};
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use serde::Serialize;

use crate::checkpoint::ModelVariant;
use crate::data::{Batch, DataSource};
use crate::entropy::{MaskEntropyAnalyzer, MaskEntropyStats, MaskStatsError};
use crate::metrics::{self, BaseMetrics, MetricsAccumulator};
use crate::model::{ModelOutput, ReconModel};

/// Final report of an evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    #[serde(flatten)]
    pub metrics: BaseMetrics,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub mask_stats: Option<MaskEntropyStats>,
    #[serde(skip)]
    pub variant: ModelVariant,
    #[serde(skip)]
    pub num_batches: usize,
    #[serde(skip)]
    pub num_images: usize,
    pub evaluated_at: chrono::DateTime<chrono::Utc>,
}

impl EvalReport {
    /// Metric name to value. Entropy keys are present only when masks were seen.
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        let mut map = BTreeMap::from([
            ("ssim", self.metrics.ssim),
            ("psnr", self.metrics.psnr),
            ("nmse", self.metrics.nmse),
        ]);
        if let Some(stats) = &self.mask_stats {
            map.insert("cond_ent_ind", stats.cond_ent_ind);
            map.insert("marg_ent_ind", stats.marg_ent_ind);
            map.insert("mi_ind", stats.mi_ind);
        }
        map
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Evaluation Results ({})", self.variant)?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "  Batches:            {:>12}", self.num_batches)?;
        writeln!(f, "  Images:             {:>12}", self.num_images)?;
        writeln!(f)?;
        writeln!(f, "  SSIM:               {:>12.4}", self.metrics.ssim)?;
        writeln!(f, "  PSNR:               {:>9.2} dB", self.metrics.psnr)?;
        writeln!(f, "  NMSE:               {:>12.6}", self.metrics.nmse)?;
        if let Some(stats) = &self.mask_stats {
            writeln!(f)?;
            writeln!(
                f,
                "  Masks:              {:>12} x {}",
                stats.num_masks, stats.num_lines
            )?;
            writeln!(f, "  cond_ent_ind:       {:>12.4}", stats.cond_ent_ind)?;
            writeln!(f, "  marg_ent_ind:       {:>12.4}", stats.marg_ent_ind)?;
            writeln!(f, "  mi_ind:             {:>12.4}", stats.mi_ind)?;
        }
        Ok(())
    }
}

/// Evaluate `model` on at most `num_batches` batches of `data`.
pub fn evaluate<B, M, D>(model: &mut M, data: &D, num_batches: Option<usize>) -> Result<EvalReport>
where
    B: Backend,
    M: ReconModel<B>,
    D: DataSource<B> + ?Sized,
{
    let mut accumulator = MetricsAccumulator::new();
    let mut analyzer = model.budget().map(MaskEntropyAnalyzer::new);

    let total = match (data.num_batches(), num_batches) {
        (Some(n), Some(cap)) => Some(n.min(cap)),
        (n, cap) => n.or(cap),
    };
    let pb = match total {
        Some(n) => ProgressBar::new(n as u64),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .map_err(|e| anyhow!("invalid progress template: {e}"))?
            .progress_chars("=>-"),
    );

    for (i, batch) in data.batches().enumerate() {
        if Some(i) == num_batches {
            break;
        }
        let batch = batch?;
        let output = model.forward(&batch)?;
        evaluate_batch(&batch, &output, &mut accumulator, analyzer.as_mut())?;
        pb.set_message(format!("{} images", accumulator.num_images()));
        pb.inc(1);
    }
    pb.finish_and_clear();

    ensure!(
        accumulator.num_batches() > 0,
        "data source produced no batches to evaluate"
    );

    let mask_stats = analyzer.and_then(MaskEntropyAnalyzer::finalize);
    Ok(EvalReport {
        metrics: accumulator.finalize(),
        mask_stats,
        variant: model.variant(),
        num_batches: accumulator.num_batches(),
        num_images: accumulator.num_images(),
        evaluated_at: chrono::Utc::now(),
    })
}

/// Route one batch's model output into the accumulators.
pub fn evaluate_batch<B: Backend>(
    batch: &Batch<B>,
    output: &ModelOutput<B>,
    accumulator: &mut MetricsAccumulator,
    analyzer: Option<&mut MaskEntropyAnalyzer>,
) -> Result<()> {
    let [b, h, w] = output.reconstruction.dims();
    ensure!(
        output.reconstruction.dims() == batch.target.dims(),
        "reconstruction shape {:?} does not match target shape {:?}",
        output.reconstruction.dims(),
        batch.target.dims()
    );
    ensure!(
        h >= metrics::SSIM_WIN && w >= metrics::SSIM_WIN,
        "images of size {h}x{w} are smaller than the {0}x{0} SSIM window",
        metrics::SSIM_WIN
    );

    let similarity: Vec<f32> = metrics::ssim(
        output.reconstruction.clone(),
        batch.target.clone(),
        batch.max_value.clone(),
    )
    .into_data()
    .convert::<f32>()
    .to_vec()
    .map_err(|e| anyhow!("ssim conversion failed: {e:?}"))?;
    let similarity: Vec<f64> = similarity.iter().map(|&v| v as f64).collect();
    accumulator.record_similarity(&similarity);

    let max_values: Vec<f32> = batch
        .max_value
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow!("max_value conversion failed: {e:?}"))?;

    for (i, &maxval) in max_values.iter().enumerate().take(b) {
        let gt = batch
            .target
            .clone()
            .slice([i..i + 1, 0..h, 0..w])
            .reshape([h, w]);
        let rec = output
            .reconstruction
            .clone()
            .slice([i..i + 1, 0..h, 0..w])
            .reshape([h, w]);
        accumulator.record(&gt, &rec, maxval as f64);
    }

    if let Some(prob_masks) = &output.extra.prob_masks {
        if prob_masks.len() != 1 {
            return Err(MaskStatsError::MultiplePolicies(prob_masks.len()).into());
        }
        let [n, _, _, lines, _] = prob_masks[0].dims();
        // [b, 1, 1, L, 1] -> [b, L]
        let rows = prob_masks[0]
            .clone()
            .slice([0..n, 0..1, 0..1, 0..lines, 0..1])
            .reshape([n, lines]);
        let values: Vec<f32> = rows
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow!("prob mask conversion failed: {e:?}"))?;
        let rows = Array2::from_shape_vec((n, lines), values)?.mapv(f64::from);

        let analyzer = analyzer
            .ok_or_else(|| anyhow!("model emitted prob masks but has no sampling budget"))?;
        analyzer.collect_batch(rows.view())?;
    }

    Ok(())
}
