//! Reconstruction quality metrics and their aggregation over an evaluation run.

use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use serde::Serialize;

/// Side length of the uniform SSIM window; images must be at least this large.
pub const SSIM_WIN: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

/// Peak Signal-to-Noise Ratio of a single image against its ground truth.
///
/// `maxval` is the dynamic range of the ground truth volume. Returns decibels,
/// or infinity when the images are identical.
pub fn psnr<B: Backend>(gt: &Tensor<B, 2>, rec: &Tensor<B, 2>, maxval: f64) -> f64 {
    let diff = gt.clone() - rec.clone();
    let mse: f64 = (diff.clone() * diff).mean().into_scalar().elem();

    if mse == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (maxval * maxval / mse).log10()
}

/// Normalized Mean Squared Error: `‖gt - rec‖² / ‖gt‖²`.
pub fn nmse<B: Backend>(gt: &Tensor<B, 2>, rec: &Tensor<B, 2>) -> f64 {
    let diff = gt.clone() - rec.clone();
    let err: f64 = (diff.clone() * diff).sum().into_scalar().elem();
    let norm: f64 = (gt.clone() * gt.clone()).sum().into_scalar().elem();
    err / norm
}

/// Per-sample structural similarity of a batch of images `[B, H, W]`.
///
/// Uses a 7x7 uniform window with unbiased (co)variance estimates. `data_range`
/// holds one dynamic-range value per sample. Returns the mean SSIM of each
/// sample, shape `[B]`.
///
/// Both spatial dimensions must be at least [`SSIM_WIN`].
pub fn ssim<B: Backend>(
    rec: Tensor<B, 3>,
    target: Tensor<B, 3>,
    data_range: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let device = rec.device();
    let [b, _, _] = rec.dims();

    let x = rec.unsqueeze_dim::<4>(1);
    let y = target.unsqueeze_dim::<4>(1);

    let np = (SSIM_WIN * SSIM_WIN) as f64;
    let cov_norm = np / (np - 1.0);
    let window = Tensor::<B, 4>::ones([1, 1, SSIM_WIN, SSIM_WIN], &device).div_scalar(np);
    let filter = |t: Tensor<B, 4>| {
        conv2d(
            t,
            window.clone(),
            None,
            ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
        )
    };

    let ux = filter(x.clone());
    let uy = filter(y.clone());
    let uxx = filter(x.clone() * x.clone());
    let uyy = filter(y.clone() * y.clone());
    let uxy = filter(x * y);

    let vx = (uxx - ux.clone() * ux.clone()).mul_scalar(cov_norm);
    let vy = (uyy - uy.clone() * uy.clone()).mul_scalar(cov_norm);
    let vxy = (uxy - ux.clone() * uy.clone()).mul_scalar(cov_norm);

    let [_, _, h, w] = ux.dims();
    let range = data_range.reshape([b, 1, 1, 1]).expand([b, 1, h, w]);
    let c1 = range.clone().mul_scalar(SSIM_K1).powf_scalar(2.0);
    let c2 = range.mul_scalar(SSIM_K2).powf_scalar(2.0);

    let a1 = (ux.clone() * uy.clone()).mul_scalar(2.0) + c1.clone();
    let a2 = vxy.mul_scalar(2.0) + c2.clone();
    let b1 = ux.clone() * ux + uy.clone() * uy + c1;
    let b2 = vx + vy + c2;

    let s = (a1 * a2) / (b1 * b2);
    s.mean_dim(3).mean_dim(2).mean_dim(1).reshape([b])
}

/// PSNR and NMSE of one evaluated image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub psnr: f64,
    pub nmse: f64,
}

/// Final reconstruction metrics of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaseMetrics {
    pub ssim: f64,
    pub psnr: f64,
    pub nmse: f64,
}

/// Running collection of per-image and per-batch metrics.
///
/// PSNR and NMSE are kept per image and averaged flat. SSIM is kept as one
/// mean per batch, and the final SSIM is the mean of those batch means, so
/// batches of unequal size are weighted equally.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    psnrs: Vec<f64>,
    nmses: Vec<f64>,
    batch_ssims: Vec<f64>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute and keep the metrics of one reconstructed image.
    pub fn record<B: Backend>(
        &mut self,
        gt: &Tensor<B, 2>,
        rec: &Tensor<B, 2>,
        max_value: f64,
    ) -> MetricSample {
        let sample = MetricSample {
            psnr: psnr(gt, rec, max_value),
            nmse: nmse(gt, rec),
        };
        self.push(sample);
        sample
    }

    /// Keep an already computed sample.
    pub fn push(&mut self, sample: MetricSample) {
        self.psnrs.push(sample.psnr);
        self.nmses.push(sample.nmse);
    }

    /// Keep the mean of one batch's per-sample SSIM scores.
    pub fn record_similarity(&mut self, scores: &[f64]) {
        self.batch_ssims.push(mean(scores));
    }

    /// Number of images recorded.
    pub fn num_images(&self) -> usize {
        self.psnrs.len()
    }

    /// Number of SSIM batches recorded.
    pub fn num_batches(&self) -> usize {
        self.batch_ssims.len()
    }

    pub fn finalize(&self) -> BaseMetrics {
        BaseMetrics {
            ssim: mean(&self.batch_ssims),
            psnr: mean(&self.psnrs),
            nmse: mean(&self.nmses),
        }
    }
}

/// Arithmetic mean; NaN for an empty slice, and NaN entries propagate.
fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
