//! Binary sample record format for MRI slices and recorded model outputs.
//!
//! Format (all multi-byte integers and floats are big-endian):
//! ```text
//! [magic:    4 bytes]  0x4D 0x52 0x53 0x00  ("MRS\0")
//! [version:  1 byte ]  0x01
//! [name_len: 2 bytes]  length of the source file name
//! [name:     name_len bytes, UTF-8]
//! [slice:    4 bytes]  slice index within the volume
//! [n_arrays: 4 bytes]
//! for each array:
//!     [key_len: 2 bytes][key: key_len bytes, UTF-8]
//!     [rank:    1 byte ]
//!     [dims:    4 bytes * rank]
//!     [data:    4 bytes * prod(dims), f32]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const MAGIC: [u8; 4] = [0x4D, 0x52, 0x53, 0x00]; // "MRS\0"
const VERSION: u8 = 1;
const MAX_ARRAYS: u32 = 64;
const MAX_RANK: u8 = 8;

/// File extension of sample records.
pub const RECORD_EXTENSION: &str = "mrs";

/// A dense f32 array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ArrayRecord {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel = numel(&shape).with_context(|| format!("array of shape {shape:?} is too large"))?;
        ensure!(
            numel == data.len(),
            "array of shape {shape:?} needs {numel} values, got {}",
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }
}

/// One slice of one volume with its named arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub fname: String,
    pub slice_num: u32,
    pub arrays: BTreeMap<String, ArrayRecord>,
}

impl SampleRecord {
    pub fn new(fname: impl Into<String>, slice_num: u32) -> Self {
        Self {
            fname: fname.into(),
            slice_num,
            arrays: BTreeMap::new(),
        }
    }

    pub fn with_array(mut self, key: impl Into<String>, array: ArrayRecord) -> Self {
        self.arrays.insert(key.into(), array);
        self
    }

    /// Look up a required array.
    pub fn array(&self, key: &str) -> Result<&ArrayRecord> {
        self.arrays.get(key).with_context(|| {
            format!(
                "record {} slice {} has no `{key}` array",
                self.fname, self.slice_num
            )
        })
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ensure!(
            self.arrays.len() <= MAX_ARRAYS as usize,
            "record {} slice {} has {} arrays, at most {MAX_ARRAYS} allowed",
            self.fname,
            self.slice_num,
            self.arrays.len()
        );
        buf.write_all(&MAGIC)?;
        buf.write_u8(VERSION)?;
        write_str(&mut buf, &self.fname)?;
        buf.write_u32::<BigEndian>(self.slice_num)?;
        buf.write_u32::<BigEndian>(self.arrays.len() as u32)?;
        for (key, array) in &self.arrays {
            ensure!(
                array.shape.len() <= MAX_RANK as usize,
                "array `{key}` has rank {}, at most {MAX_RANK} allowed",
                array.shape.len()
            );
            write_str(&mut buf, key)?;
            buf.write_u8(array.shape.len() as u8)?;
            for &dim in &array.shape {
                let dim = u32::try_from(dim)
                    .with_context(|| format!("dimension {dim} of `{key}` does not fit in u32"))?;
                buf.write_u32::<BigEndian>(dim)?;
            }
            for &value in &array.data {
                buf.write_f32::<BigEndian>(value)?;
            }
        }
        Ok(buf)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);

        read_header(&mut cur)?;
        let fname = read_str(&mut cur).context("failed to read file name")?;
        let slice_num = cur
            .read_u32::<BigEndian>()
            .context("failed to read slice number")?;

        let n_arrays = cur
            .read_u32::<BigEndian>()
            .context("failed to read array count")?;
        if n_arrays > MAX_ARRAYS {
            bail!("unreasonable array count: {n_arrays}");
        }

        let mut arrays = BTreeMap::new();
        for i in 0..n_arrays {
            let key = read_str(&mut cur).with_context(|| format!("failed to read key of array {i}"))?;
            let rank = cur
                .read_u8()
                .with_context(|| format!("failed to read rank of `{key}`"))?;
            if rank > MAX_RANK {
                bail!("unreasonable rank {rank} for `{key}`");
            }
            let mut shape = Vec::with_capacity(rank as usize);
            for _ in 0..rank {
                shape.push(cur.read_u32::<BigEndian>()? as usize);
            }
            let remaining = data.len() as u64 - cur.position();
            let numel = numel(&shape)
                .filter(|n| n.checked_mul(4).is_some_and(|bytes| bytes as u64 <= remaining))
                .with_context(|| format!("array `{key}` of shape {shape:?} overruns the record"))?;
            let mut values = vec![0f32; numel];
            cur.read_f32_into::<BigEndian>(&mut values)
                .with_context(|| format!("failed to read data of `{key}`"))?;
            arrays.insert(key, ArrayRecord { shape, data: values });
        }

        Ok(Self {
            fname,
            slice_num,
            arrays,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to decode {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()?)
            .with_context(|| format!("failed to write record to {}", path.display()))
    }
}

/// Read and check the magic and version that open every record.
pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .context("failed to read record magic")?;
    ensure!(magic == MAGIC, "invalid record magic: expected MRS\\0");

    let version = reader.read_u8().context("failed to read record version")?;
    ensure!(
        version == VERSION,
        "unsupported record version {version}, expected {VERSION}"
    );
    Ok(())
}

/// Element count of a shape, `None` on overflow.
fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    ensure!(s.len() <= u16::MAX as usize, "string too long for record: {} bytes", s.len());
    buf.write_u16::<BigEndian>(s.len() as u16)?;
    buf.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u16::<BigEndian>()?;
    let mut bytes = vec![0u8; len as usize];
    cur.read_exact(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

/// Collect all record files in a directory (not recursive), sorted by path.
pub fn collect_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("cannot read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleRecord {
        SampleRecord::new("file1000001.h5", 17)
            .with_array("target", ArrayRecord::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.5]).unwrap())
            .with_array("max_value", ArrayRecord::scalar(5.5))
    }

    #[test]
    fn preserves_names_shapes_and_data() {
        let record = sample();
        let decoded = SampleRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.array("max_value").unwrap().shape, Vec::<usize>::new());
        assert!(decoded.array("kspace").is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        let err = SampleRecord::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn rejects_truncated_data() {
        let bytes = sample().to_bytes().unwrap();
        assert!(SampleRecord::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn rejects_overflowing_dims() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        write_str(&mut bytes, "file1").unwrap();
        bytes.write_u32::<BigEndian>(0).unwrap();
        bytes.write_u32::<BigEndian>(1).unwrap();
        write_str(&mut bytes, "kspace").unwrap();
        bytes.push(3);
        for _ in 0..3 {
            bytes.write_u32::<BigEndian>(u32::MAX).unwrap();
        }
        bytes.extend_from_slice(&[0u8; 16]);

        let err = SampleRecord::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn refuses_to_write_unreadable_records() {
        let deep = ArrayRecord::new(vec![1; MAX_RANK as usize + 1], vec![0.0]).unwrap();
        let err = sample().with_array("deep", deep).to_bytes().unwrap_err();
        assert!(err.to_string().contains("rank"));

        let mut wide = sample();
        for i in 0..MAX_ARRAYS {
            wide = wide.with_array(format!("extra{i}"), ArrayRecord::scalar(0.0));
        }
        assert!(wide.to_bytes().is_err());
    }

    #[test]
    fn shape_must_match_data() {
        assert!(ArrayRecord::new(vec![2, 2], vec![1.0; 3]).is_err());
    }

    #[test]
    fn collects_only_records() {
        let dir = tempfile::tempdir().unwrap();
        sample().write(&dir.path().join("b.mrs")).unwrap();
        sample().write(&dir.path().join("a.mrs")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let found = collect_records(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("a.mrs"));
    }
}
