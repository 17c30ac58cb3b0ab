use std::path::PathBuf;

use anyhow::Result;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::NdArray;
use burn::prelude::*;
use clap::{Parser, Subcommand};

use mrieval::checkpoint::Checkpoint;
use mrieval::config::{parse_bool, Challenge, DataMode, DeviceKind, EvalConfig, MaskConfig, MaskType};
use mrieval::data::SliceDataLoader;
use mrieval::eval;
use mrieval::model::RecordedModel;

/// Evaluate pretrained MRI reconstruction models.
///
/// Reports SSIM, PSNR and NMSE of the reconstructions against the fully
/// sampled targets. For checkpoints with an adaptive sampling policy, also
/// reports the entropy of the policy's masks:
///
///   marg_ent_ind: entropy of the average mask over the dataset
///   cond_ent_ind: average entropy of the individual masks
///   mi_ind:       their difference (mutual information)
#[derive(Parser)]
#[command(name = "mrieval", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a checkpoint on a dataset split.
    Evaluate {
        /// Model checkpoint to load (manifest file or directory).
        #[arg(long)]
        load_checkpoint: PathBuf,

        /// Directory of recorded model outputs (defaults to <checkpoint dir>/outputs).
        #[arg(long)]
        outputs: Option<PathBuf>,

        /// Undersampling mask type.
        #[arg(long, default_value = "adaptive_equispaced_fraction", value_enum)]
        mask_type: MaskType,

        /// Number of center lines to use in mask.
        /// 0.08 for acceleration 4, 0.04 for acceleration 8 models.
        #[arg(long, num_args = 1.., default_values_t = [0.08])]
        center_fractions: Vec<f64>,

        /// Acceleration rates to use.
        #[arg(long, num_args = 1.., default_values_t = [4])]
        accelerations: Vec<u32>,

        /// Crop size used by checkpoint.
        #[arg(long, num_args = 1.., default_values_t = [128, 128])]
        crop_size: Vec<usize>,

        /// Stop after this many batches.
        #[arg(long)]
        num_batches: Option<usize>,

        /// Split to evaluate on.
        #[arg(long, default_value = "val", value_enum)]
        data_mode: DataMode,

        /// Whether to skip low-frequency lines when computing equispaced mask.
        #[arg(long, default_value = "true", value_parser = parse_bool, action = clap::ArgAction::Set)]
        skip_low_freqs: bool,

        /// Path to the dataset root.
        #[arg(long, default_value = "./knee")]
        data_path: PathBuf,

        /// Path to the evaluated split, overriding --data-path.
        #[arg(long)]
        test_path: Option<PathBuf>,

        /// Acquisition challenge.
        #[arg(long, default_value = "multicoil", value_enum)]
        challenge: Challenge,

        /// Number of slices per batch.
        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// Number of data loader workers.
        #[arg(long, default_value_t = 20)]
        num_workers: usize,

        /// Fraction of slices to evaluate.
        #[arg(long)]
        sample_rate: Option<f64>,

        /// Fraction of volumes to evaluate.
        #[arg(long)]
        volume_sample_rate: Option<f64>,

        /// Seed for data sub-sampling and mask generation.
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Compute device (cpu or gpu).
        #[arg(long, default_value = "cpu", value_enum)]
        device: DeviceKind,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show which model variant a checkpoint resolves to.
    Inspect {
        /// Model checkpoint (manifest file or directory).
        checkpoint: PathBuf,
    },
}

/// Run the evaluate command with a specific backend.
fn run_evaluate<B: Backend>(config: EvalConfig, device: B::Device) -> Result<()> {
    let data = SliceDataLoader::<B>::new(&config, device.clone())?;
    let mut model = RecordedModel::<B>::load(&config.checkpoint, config.outputs_dir.as_deref(), device)?;

    let report = eval::evaluate(&mut model, &data, config.num_batches)?;
    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Evaluate {
            load_checkpoint,
            outputs,
            mask_type,
            center_fractions,
            accelerations,
            crop_size,
            num_batches,
            data_mode,
            skip_low_freqs,
            data_path,
            test_path,
            challenge,
            batch_size,
            num_workers,
            sample_rate,
            volume_sample_rate,
            seed,
            device,
            json,
        } => {
            let config = EvalConfig {
                checkpoint: load_checkpoint,
                outputs_dir: outputs,
                mask: MaskConfig {
                    mask_type,
                    center_fractions,
                    accelerations,
                    skip_low_freqs,
                },
                crop_size,
                num_batches,
                data_mode,
                data_path,
                test_path,
                challenge,
                batch_size,
                num_workers,
                sample_rate,
                volume_sample_rate,
                seed,
                device,
                json,
            };
            config.validate()?;

            match device {
                DeviceKind::Cpu => run_evaluate::<NdArray>(config, Default::default())?,
                DeviceKind::Gpu => {
                    eprintln!("Using GPU (WGPU)");
                    run_evaluate::<Wgpu>(config, WgpuDevice::default())?;
                }
            }
        }

        Commands::Inspect { checkpoint } => {
            let ckpt = Checkpoint::load(&checkpoint)?;
            let variant = ckpt.resolve_variant()?;
            println!("Checkpoint:  {}", checkpoint.display());
            println!("  Variant:     {variant}");
            if let Some(budget) = ckpt.budget().filter(|_| variant.has_policy()) {
                println!("  Budget:      {budget} lines");
            }
            println!("  Tensors:     {}", ckpt.state_dict.len());
            println!("  Parameters:  {}", ckpt.num_parameters());
        }
    }

    Ok(())
}
