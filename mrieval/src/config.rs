use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::metrics::SSIM_WIN;

/// Supported k-space undersampling mask families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskType {
    /// Uniformly random lines outside a fully sampled center band.
    Random,
    /// Equispaced lines with the acceleration adjusted for the center band.
    EquispacedFraction,
    /// Equispaced lines at the nominal acceleration, as used to seed an adaptive policy.
    AdaptiveEquispacedFraction,
}

impl MaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::EquispacedFraction => "equispaced_fraction",
            Self::AdaptiveEquispacedFraction => "adaptive_equispaced_fraction",
        }
    }
}

impl std::fmt::Display for MaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which data split to evaluate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    Train,
    Val,
}

impl DataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
        }
    }
}

/// Acquisition challenge, which selects the dataset directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Singlecoil,
    Multicoil,
}

impl Challenge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Singlecoil => "singlecoil",
            Self::Multicoil => "multicoil",
        }
    }
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Parameters of the undersampling mask applied to full k-space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskConfig {
    pub mask_type: MaskType,
    /// Fraction of low-frequency lines always sampled, one per acceleration.
    pub center_fractions: Vec<f64>,
    /// Acceleration factors to draw from.
    pub accelerations: Vec<u32>,
    /// Skip the low-frequency band when placing equispaced lines.
    pub skip_low_freqs: bool,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            mask_type: MaskType::AdaptiveEquispacedFraction,
            center_fractions: vec![0.08],
            accelerations: vec![4],
            skip_low_freqs: true,
        }
    }
}

impl MaskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.center_fractions.is_empty(),
            "at least one center fraction is required"
        );
        anyhow::ensure!(
            self.center_fractions.len() == self.accelerations.len(),
            "number of center fractions ({}) must match number of accelerations ({})",
            self.center_fractions.len(),
            self.accelerations.len()
        );
        for &cf in &self.center_fractions {
            anyhow::ensure!(
                cf > 0.0 && cf < 1.0,
                "center fraction must be in (0, 1), got {cf}"
            );
        }
        for &acc in &self.accelerations {
            anyhow::ensure!(acc >= 1, "acceleration must be at least 1, got {acc}");
        }
        Ok(())
    }
}

/// Top-level configuration of an evaluation run.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Checkpoint manifest, or a directory containing `checkpoint.json`.
    pub checkpoint: PathBuf,
    /// Directory of recorded model outputs; defaults to `<checkpoint dir>/outputs`.
    pub outputs_dir: Option<PathBuf>,
    pub mask: MaskConfig,
    /// Crop size used by the checkpoint; must have exactly two entries.
    pub crop_size: Vec<usize>,
    /// Stop after this many batches.
    pub num_batches: Option<usize>,
    pub data_mode: DataMode,
    /// Root of the dataset (contains `<challenge>_<split>` directories).
    pub data_path: PathBuf,
    /// Explicit directory for the evaluated split, overriding `data_path`.
    pub test_path: Option<PathBuf>,
    pub challenge: Challenge,
    pub batch_size: usize,
    /// Loader worker count; recorded for parity with the training setup.
    pub num_workers: usize,
    /// Fraction of slices to keep.
    pub sample_rate: Option<f64>,
    /// Fraction of volumes to keep.
    pub volume_sample_rate: Option<f64>,
    /// Seed for data sub-sampling and mask generation.
    pub seed: u64,
    pub device: DeviceKind,
    /// Print the final report as JSON instead of a table.
    pub json: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("checkpoint.json"),
            outputs_dir: None,
            mask: MaskConfig::default(),
            crop_size: vec![128, 128],
            num_batches: None,
            data_mode: DataMode::Val,
            data_path: PathBuf::from("./knee"),
            test_path: None,
            challenge: Challenge::Multicoil,
            batch_size: 1,
            num_workers: 20,
            sample_rate: None,
            volume_sample_rate: None,
            seed: 0,
            device: DeviceKind::Cpu,
            json: false,
        }
    }
}

impl EvalConfig {
    /// Crop size as `(height, width)`. Only valid after `validate`.
    pub fn crop(&self) -> (usize, usize) {
        (self.crop_size[0], self.crop_size[1])
    }

    /// Directory holding the slices of the evaluated split.
    pub fn split_dir(&self) -> PathBuf {
        match &self.test_path {
            Some(path) => path.clone(),
            None => self.data_path.join(format!(
                "{}_{}",
                self.challenge.as_str(),
                self.data_mode.as_str()
            )),
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.crop_size.len() == 2,
            "Crop size must be of length 2, not {}.",
            self.crop_size.len()
        );
        anyhow::ensure!(
            self.crop_size.iter().all(|&d| d >= SSIM_WIN),
            "crop size entries must be at least {SSIM_WIN} (the SSIM window), got {:?}",
            self.crop_size
        );
        anyhow::ensure!(self.batch_size >= 1, "batch size must be at least 1");
        anyhow::ensure!(
            self.sample_rate.is_none() || self.volume_sample_rate.is_none(),
            "either sample_rate or volume_sample_rate can be set, not both"
        );
        for (name, rate) in [
            ("sample_rate", self.sample_rate),
            ("volume_sample_rate", self.volume_sample_rate),
        ] {
            if let Some(rate) = rate {
                anyhow::ensure!(
                    rate > 0.0 && rate <= 1.0,
                    "{name} must be in (0, 1], got {rate}"
                );
            }
        }
        self.mask.validate()
    }
}

/// Parse a boolean command-line literal.
pub fn parse_bool(v: &str) -> Result<bool, String> {
    match v.to_lowercase().as_str() {
        "yes" | "true" | "t" | "y" | "1" => Ok(true),
        "no" | "false" | "f" | "n" | "0" => Ok(false),
        _ => Err(format!("boolean value expected, got `{v}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_literals() {
        for v in ["yes", "True", "t", "Y", "1"] {
            assert_eq!(parse_bool(v), Ok(true), "{v}");
        }
        for v in ["no", "FALSE", "f", "n", "0"] {
            assert_eq!(parse_bool(v), Ok(false), "{v}");
        }
        assert!(parse_bool("maybe").is_err());
        assert!(parse_bool("").is_err());
    }

    #[test]
    fn default_config_is_valid() {
        EvalConfig::default().validate().unwrap();
    }

    #[test]
    fn crop_size_arity_is_enforced() {
        let config = EvalConfig {
            crop_size: vec![128, 128, 3],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("length 2, not 3"));

        let config = EvalConfig {
            crop_size: vec![320],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn crop_must_fit_ssim_window() {
        let config = EvalConfig {
            crop_size: vec![4, 4],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 7"));

        let config = EvalConfig {
            crop_size: vec![7, 320],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn mask_lists_must_pair_up() {
        let config = EvalConfig {
            mask: MaskConfig {
                center_fractions: vec![0.08, 0.04],
                accelerations: vec![4],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_rates_are_exclusive() {
        let config = EvalConfig {
            sample_rate: Some(0.5),
            volume_sample_rate: Some(0.5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn split_dir_layout() {
        let config = EvalConfig {
            data_path: PathBuf::from("/data/knee"),
            data_mode: DataMode::Train,
            ..Default::default()
        };
        assert_eq!(config.split_dir(), PathBuf::from("/data/knee/multicoil_train"));

        let config = EvalConfig {
            test_path: Some(PathBuf::from("/data/custom")),
            ..config
        };
        assert_eq!(config.split_dir(), PathBuf::from("/data/custom"));
    }
}
