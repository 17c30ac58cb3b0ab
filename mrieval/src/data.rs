//! Slice datasets, batching, and the batch contract seen by models.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use byteorder::{BigEndian, ReadBytesExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{DataMode, EvalConfig};
use crate::record::{self, ArrayRecord, SampleRecord};
use crate::subsample::{apply_mask, MaskFunc};

/// A batch of undersampled slices.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Fully sampled k-space `[B, C, H, W, 2]`.
    pub kspace: Tensor<B, 5>,
    /// Undersampled k-space, same shape as `kspace`.
    pub masked_kspace: Tensor<B, 5>,
    /// Column mask `[B, 1, 1, W, 1]`.
    pub mask: Tensor<B, 5>,
    /// Ground-truth images `[B, H, W]`.
    pub target: Tensor<B, 3>,
    /// Per-sample dynamic range `[B]`.
    pub max_value: Tensor<B, 1>,
    pub fnames: Vec<String>,
    pub slice_nums: Vec<u32>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.fnames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fnames.is_empty()
    }
}

/// An ordered, restartable sequence of batches.
pub trait DataSource<B: Backend> {
    /// Iterate the batches from the start.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch<B>>> + '_>;

    /// Number of batches, when known up front.
    fn num_batches(&self) -> Option<usize> {
        None
    }
}

/// Location and identity of one slice on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRef {
    pub path: PathBuf,
    pub fname: String,
    pub slice_num: u32,
}

/// Read just the identity header of a sample record.
fn read_slice_ref(path: &Path) -> Result<SliceRef> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    record::read_header(&mut reader).with_context(|| format!("{} is not a sample record", path.display()))?;
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut name = vec![0u8; len];
    reader.read_exact(&mut name)?;
    let slice_num = reader.read_u32::<BigEndian>()?;

    Ok(SliceRef {
        path: path.to_path_buf(),
        fname: String::from_utf8(name)
            .with_context(|| format!("bad file name in {}", path.display()))?,
        slice_num,
    })
}

/// Keep a seeded random fraction of slices, or of whole volumes.
fn subsample_slices(
    mut slices: Vec<SliceRef>,
    sample_rate: Option<f64>,
    volume_sample_rate: Option<f64>,
    rng: &mut StdRng,
) -> Vec<SliceRef> {
    if let Some(rate) = sample_rate.filter(|&r| r < 1.0) {
        slices.shuffle(rng);
        let keep = (slices.len() as f64 * rate).round() as usize;
        slices.truncate(keep);
    } else if let Some(rate) = volume_sample_rate.filter(|&r| r < 1.0) {
        let mut volumes: Vec<String> = slices
            .iter()
            .map(|s| s.fname.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        volumes.shuffle(rng);
        let keep = (volumes.len() as f64 * rate).round() as usize;
        let kept: BTreeSet<String> = volumes.into_iter().take(keep).collect();
        slices.retain(|s| kept.contains(&s.fname));
    }
    slices
}

/// Loads `.mrs` slice records, undersamples their k-space, and batches them.
#[derive(Debug)]
pub struct SliceDataLoader<B: Backend> {
    slices: Vec<SliceRef>,
    mask_func: MaskFunc,
    crop: (usize, usize),
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> SliceDataLoader<B> {
    /// Index the split directory selected by `config`.
    pub fn new(config: &EvalConfig, device: B::Device) -> Result<Self> {
        let dir = config.split_dir();
        let paths = record::collect_records(&dir)?;
        let slices = paths
            .iter()
            .map(|p| read_slice_ref(p))
            .collect::<Result<Vec<_>>>()?;
        ensure!(!slices.is_empty(), "no slice records found in {}", dir.display());

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut slices = subsample_slices(
            slices,
            config.sample_rate,
            config.volume_sample_rate,
            &mut rng,
        );
        if config.data_mode == DataMode::Train {
            slices.shuffle(&mut rng);
        }

        let volumes: BTreeSet<&str> = slices.iter().map(|s| s.fname.as_str()).collect();
        log::info!(
            "{}: {} slices from {} volumes",
            dir.display(),
            slices.len(),
            volumes.len()
        );
        log::debug!("num_workers={} (records are loaded sequentially)", config.num_workers);

        Ok(Self {
            slices,
            mask_func: MaskFunc::new(config.mask.clone(), config.seed),
            crop: config.crop(),
            batch_size: config.batch_size,
            device,
        })
    }

    pub fn slices(&self) -> &[SliceRef] {
        &self.slices
    }

    fn load_batch(&self, chunk: &[SliceRef]) -> Result<Batch<B>> {
        let mut kspaces = Vec::with_capacity(chunk.len());
        let mut masked = Vec::with_capacity(chunk.len());
        let mut masks = Vec::with_capacity(chunk.len());
        let mut targets = Vec::with_capacity(chunk.len());
        let mut max_values = Vec::with_capacity(chunk.len());
        let mut fnames = Vec::with_capacity(chunk.len());
        let mut slice_nums = Vec::with_capacity(chunk.len());
        let mut kspace_shape: Option<Vec<usize>> = None;

        for slice in chunk {
            let rec = SampleRecord::read(&slice.path)?;
            let kspace = rec.array("kspace")?;
            let target = rec.array("target")?;
            let max_value = rec.array("max_value")?;

            ensure!(
                kspace.shape.len() == 4 && kspace.shape[3] == 2,
                "{}: kspace must be [coils, H, W, 2], got {:?}",
                slice.path.display(),
                kspace.shape
            );
            ensure!(
                target.shape == [self.crop.0, self.crop.1],
                "{}: target shape {:?} does not match crop size {:?}",
                slice.path.display(),
                target.shape,
                self.crop
            );
            ensure!(
                max_value.data.len() == 1,
                "{}: max_value must be a scalar",
                slice.path.display()
            );
            match &kspace_shape {
                Some(shape) => ensure!(
                    *shape == kspace.shape,
                    "{}: kspace shape {:?} differs from {:?} earlier in the batch",
                    slice.path.display(),
                    kspace.shape,
                    shape
                ),
                None => kspace_shape = Some(kspace.shape.clone()),
            }

            let full = to_tensor::<B, 4>(kspace, &self.device);
            let columns = self.mask_func.sample_mask(kspace.shape[2], &rec.fname);
            let (under, mask) = apply_mask(full.clone(), &columns);

            kspaces.push(full);
            masked.push(under);
            masks.push(mask);
            targets.push(to_tensor::<B, 2>(target, &self.device));
            max_values.push(max_value.data[0]);
            fnames.push(rec.fname);
            slice_nums.push(rec.slice_num);
        }

        Ok(Batch {
            kspace: Tensor::stack(kspaces, 0),
            masked_kspace: Tensor::stack(masked, 0),
            mask: Tensor::stack(masks, 0),
            target: Tensor::stack(targets, 0),
            max_value: Tensor::<B, 1>::from_floats(max_values.as_slice(), &self.device),
            fnames,
            slice_nums,
        })
    }
}

impl<B: Backend> DataSource<B> for SliceDataLoader<B> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch<B>>> + '_> {
        Box::new(
            self.slices
                .chunks(self.batch_size)
                .map(move |chunk| self.load_batch(chunk)),
        )
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.slices.len().div_ceil(self.batch_size))
    }
}

/// Build a tensor from a record array of known rank.
pub fn to_tensor<B: Backend, const D: usize>(array: &ArrayRecord, device: &B::Device) -> Tensor<B, D> {
    let shape: [usize; D] = std::array::from_fn(|i| array.shape[i]);
    Tensor::<B, 1>::from_floats(array.data.as_slice(), device).reshape(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn write_slice(dir: &Path, fname: &str, slice: u32, width: usize) {
        let kspace = ArrayRecord::new(vec![2, 4, width, 2], vec![1.0; 2 * 4 * width * 2]).unwrap();
        let target = ArrayRecord::new(vec![4, width], vec![0.5; 4 * width]).unwrap();
        SampleRecord::new(fname, slice)
            .with_array("kspace", kspace)
            .with_array("target", target)
            .with_array("max_value", ArrayRecord::scalar(0.5))
            .write(&dir.join(format!("{fname}_{slice:03}.mrs")))
            .unwrap();
    }

    fn config(root: &Path) -> EvalConfig {
        EvalConfig {
            data_path: root.to_path_buf(),
            crop_size: vec![4, 16],
            batch_size: 2,
            ..Default::default()
        }
    }

    fn slice_refs(names: &[(&str, u32)]) -> Vec<SliceRef> {
        names
            .iter()
            .map(|&(fname, slice_num)| SliceRef {
                path: PathBuf::from(format!("{fname}_{slice_num}.mrs")),
                fname: fname.to_string(),
                slice_num,
            })
            .collect()
    }

    #[test]
    fn batches_stack_slices() {
        let root = tempfile::tempdir().unwrap();
        let split = root.path().join("multicoil_val");
        std::fs::create_dir_all(&split).unwrap();
        for slice in 0..3 {
            write_slice(&split, "file1", slice, 16);
        }

        let loader = SliceDataLoader::<NdArray>::new(&config(root.path()), Default::default()).unwrap();
        assert_eq!(loader.num_batches(), Some(2));

        let batches: Vec<_> = loader.batches().collect::<Result<_>>().unwrap();
        assert_eq!(batches[0].kspace.dims(), [2, 2, 4, 16, 2]);
        assert_eq!(batches[0].mask.dims(), [2, 1, 1, 16, 1]);
        assert_eq!(batches[0].target.dims(), [2, 4, 16]);
        assert_eq!(batches[0].slice_nums, vec![0, 1]);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1].max_value.dims(), [1]);
    }

    #[test]
    fn crop_mismatch_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let split = root.path().join("multicoil_val");
        std::fs::create_dir_all(&split).unwrap();
        write_slice(&split, "file1", 0, 8);

        let loader = SliceDataLoader::<NdArray>::new(&config(root.path()), Default::default()).unwrap();
        let err = loader.batches().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("crop size"));
    }

    #[test]
    fn empty_split_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("multicoil_val")).unwrap();
        assert!(SliceDataLoader::<NdArray>::new(&config(root.path()), Default::default()).is_err());
    }

    #[test]
    fn foreign_files_are_rejected_when_indexing() {
        let root = tempfile::tempdir().unwrap();
        let split = root.path().join("multicoil_val");
        std::fs::create_dir_all(&split).unwrap();
        write_slice(&split, "file1", 0, 16);
        std::fs::write(split.join("notes.mrs"), b"not a record at all").unwrap();

        let err = SliceDataLoader::<NdArray>::new(&config(root.path()), Default::default()).unwrap_err();
        assert!(format!("{err:#}").contains("magic"));
    }

    #[test]
    fn slice_sampling_is_seeded() {
        let slices = slice_refs(&[("a", 0), ("a", 1), ("b", 0), ("b", 1), ("c", 0)]);
        let pick = |seed| {
            subsample_slices(slices.clone(), Some(0.4), None, &mut StdRng::seed_from_u64(seed))
        };
        assert_eq!(pick(3).len(), 2);
        assert_eq!(pick(3), pick(3));
    }

    #[test]
    fn volume_sampling_keeps_whole_volumes() {
        let slices = slice_refs(&[("a", 0), ("a", 1), ("b", 0), ("b", 1)]);
        let kept = subsample_slices(slices, None, Some(0.5), &mut StdRng::seed_from_u64(0));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].fname, kept[1].fname);
    }
}
