//! Entropy statistics over sampling-policy probability masks.
//!
//! An adaptive policy emits, for every slice, a probability vector over the
//! candidate k-space lines whose entries sum to the acquisition budget. Treating
//! each line as an independent Bernoulli variable gives three summary numbers:
//!
//! 1. **Marginal entropy**: entropy of the average mask over the dataset.
//! 2. **Conditional entropy**: entropy of each individual mask, averaged.
//! 3. **Mutual information**: their difference; how much the chosen lines
//!    depend on the input rather than being fixed for the whole dataset.

use ndarray::{Array2, ArrayView2, Axis};
use serde::Serialize;
use thiserror::Error;

/// Relative tolerance used when comparing a mask sum against the budget.
const BUDGET_RTOL: f64 = 1e-5;
/// Absolute tolerance used when comparing a mask sum against the budget.
const BUDGET_ATOL: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum MaskStatsError {
    #[error("sum of a prob mask should match budget {budget} but it was {sum}")]
    BudgetMismatch { budget: usize, sum: f64 },

    #[error("prob mask has {got} lines, expected {expected} like the previous masks")]
    WidthMismatch { expected: usize, got: usize },

    #[error(
        "found {0} prob masks for one batch; multiple policies in one checkpoint are not supported"
    )]
    MultiplePolicies(usize),
}

/// Binary entropy in nats, with `H(0) = H(1) = 0`.
pub fn binary_entropy(p: f64) -> f64 {
    if p == 0.0 || p == 1.0 {
        return 0.0;
    }
    -(p * p.ln() + (1.0 - p) * (1.0 - p).ln())
}

/// Final statistics over every collected mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaskEntropyStats {
    pub cond_ent_ind: f64,
    pub marg_ent_ind: f64,
    pub mi_ind: f64,
    /// Number of masks the statistics were computed over.
    #[serde(skip)]
    pub num_masks: usize,
    /// Number of candidate lines per mask.
    #[serde(skip)]
    pub num_lines: usize,
}

/// Collects probability-mask rows during evaluation and reduces them once.
#[derive(Debug)]
pub struct MaskEntropyAnalyzer {
    budget: usize,
    width: Option<usize>,
    rows: Vec<f64>,
}

impl MaskEntropyAnalyzer {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            width: None,
            rows: Vec::new(),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of mask rows collected so far.
    pub fn len(&self) -> usize {
        match self.width {
            Some(w) if w > 0 => self.rows.len() / w,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add one mask row after checking that it spends exactly the budget.
    pub fn collect(&mut self, row: &[f64]) -> Result<(), MaskStatsError> {
        let sum: f64 = row.iter().sum();
        let budget = self.budget as f64;
        if !((sum - budget).abs() <= BUDGET_ATOL + BUDGET_RTOL * budget.abs()) {
            return Err(MaskStatsError::BudgetMismatch {
                budget: self.budget,
                sum,
            });
        }

        match self.width {
            Some(expected) if expected != row.len() => {
                return Err(MaskStatsError::WidthMismatch {
                    expected,
                    got: row.len(),
                });
            }
            Some(_) => {}
            None => self.width = Some(row.len()),
        }

        self.rows.extend_from_slice(row);
        Ok(())
    }

    /// Add every row of a `[batch, lines]` block of masks.
    pub fn collect_batch(&mut self, masks: ArrayView2<'_, f64>) -> Result<(), MaskStatsError> {
        for row in masks.rows() {
            match row.as_slice() {
                Some(slice) => self.collect(slice)?,
                None => self.collect(&row.to_vec())?,
            }
        }
        Ok(())
    }

    /// Reduce the collected masks. Returns `None` when nothing was collected.
    pub fn finalize(self) -> Option<MaskEntropyStats> {
        let width = self.width?;
        if width == 0 || self.rows.is_empty() {
            return None;
        }
        let n = self.rows.len() / width;
        let masks = Array2::from_shape_vec((n, width), self.rows).ok()?;

        log::info!("Computed {n} masks of size {width}");

        let marginal = masks.mean_axis(Axis(0))?;
        let marg_ent_ind = marginal.mapv(binary_entropy).sum();
        let cond_ent_ind = masks
            .mapv(binary_entropy)
            .sum_axis(Axis(1))
            .mean()
            .unwrap_or(f64::NAN);

        Some(MaskEntropyStats {
            cond_ent_ind,
            marg_ent_ind,
            mi_ind: marg_ent_ind - cond_ent_ind,
            num_masks: n,
            num_lines: width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const EPS: f64 = 1e-12;

    #[test]
    fn entropy_is_zero_at_endpoints() {
        assert_eq!(binary_entropy(0.0), 0.0);
        assert_eq!(binary_entropy(1.0), 0.0);
    }

    #[test]
    fn entropy_symmetric_and_bounded() {
        let max = binary_entropy(0.5);
        assert!((max - std::f64::consts::LN_2).abs() < EPS);
        for i in 1..100 {
            let p = i as f64 / 100.0;
            assert!((binary_entropy(p) - binary_entropy(1.0 - p)).abs() < 1e-12);
            assert!(binary_entropy(p) <= max + EPS);
        }
    }

    #[test]
    fn budget_mismatch_is_rejected() {
        let mut analyzer = MaskEntropyAnalyzer::new(2);
        let err = analyzer.collect(&[1.0, 0.5, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, MaskStatsError::BudgetMismatch { budget: 2, .. }));
        assert!(analyzer.is_empty());
    }

    #[test]
    fn small_float_noise_is_tolerated() {
        let mut analyzer = MaskEntropyAnalyzer::new(2);
        analyzer.collect(&[0.7, 0.6, 0.4, 0.3 + 1e-7]).unwrap();
        assert_eq!(analyzer.len(), 1);
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut analyzer = MaskEntropyAnalyzer::new(1);
        analyzer.collect(&[0.5, 0.5]).unwrap();
        let err = analyzer.collect(&[0.5, 0.25, 0.25]).unwrap_err();
        assert!(matches!(
            err,
            MaskStatsError::WidthMismatch { expected: 2, got: 3 }
        ));
    }

    #[test]
    fn no_masks_gives_no_stats() {
        assert!(MaskEntropyAnalyzer::new(4).finalize().is_none());
    }

    #[test]
    fn distinct_binary_masks() {
        let mut analyzer = MaskEntropyAnalyzer::new(2);
        let masks = array![
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 0.0, 1.0, 0.0],
            [0.0, 1.0, 1.0, 0.0]
        ];
        analyzer.collect_batch(masks.view()).unwrap();
        let stats = analyzer.finalize().unwrap();

        let h = binary_entropy(2.0 / 3.0);
        assert_eq!(stats.num_masks, 3);
        assert_eq!(stats.num_lines, 4);
        assert!((stats.marg_ent_ind - 3.0 * h).abs() < EPS);
        assert_eq!(stats.cond_ent_ind, 0.0);
        assert!((stats.mi_ind - 3.0 * h).abs() < EPS);
    }

    #[test]
    fn identical_masks_carry_no_information() {
        let row = [0.9, 0.6, 0.3, 0.2];
        let mut analyzer = MaskEntropyAnalyzer::new(2);
        for _ in 0..5 {
            analyzer.collect(&row).unwrap();
        }
        let stats = analyzer.finalize().unwrap();
        let row_entropy: f64 = row.iter().map(|&p| binary_entropy(p)).sum();
        assert!((stats.cond_ent_ind - row_entropy).abs() < 1e-9);
        assert!(stats.mi_ind.abs() < 1e-9);
    }

    #[test]
    fn near_deterministic_distinct_masks() {
        let eps = 1e-6;
        let mut analyzer = MaskEntropyAnalyzer::new(1);
        for i in 0..4 {
            let mut row = [eps / 3.0; 4];
            row[i] = 1.0 - eps;
            analyzer.collect(&row).unwrap();
        }
        let stats = analyzer.finalize().unwrap();
        assert!(stats.cond_ent_ind < 1e-3);
        assert!((stats.mi_ind - stats.marg_ent_ind).abs() < 1e-3);
    }

    #[test]
    fn mutual_information_is_nonnegative() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut analyzer = MaskEntropyAnalyzer::new(3);
        for _ in 0..50 {
            let raw: Vec<f64> = (0..8).map(|_| rng.gen_range(0.05..1.0)).collect();
            let total: f64 = raw.iter().sum();
            let row: Vec<f64> = raw.iter().map(|v| v * 3.0 / total).collect();
            if row.iter().all(|&p| p <= 1.0) {
                analyzer.collect(&row).unwrap();
            }
        }
        let stats = analyzer.finalize().unwrap();
        assert_eq!(stats.mi_ind, stats.marg_ent_ind - stats.cond_ent_ind);
        assert!(stats.mi_ind >= -1e-9);
    }
}
