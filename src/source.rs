//! Chunk-wise loader for archived ECEI data.
//!
//! The generator reads the configured channel block out of a raw archive
//! once, keeps it in memory and serves it chunk by chunk, the same
//! cache-then-slice lifecycle the upstream shot archives are read with.
//!
//! The archive layout is row-major `[channels, samples]`, little-endian,
//! with the element type given by `datasource.datatype` (`int` for 32-bit
//! integers, `float` for 64-bit floats). Values are served as `f64` either
//! way; the per-channel offsets are removed downstream by the processor's
//! normalizer.

use std::fs;

use ndarray::{Array2, ArrayView2};

use crate::config::{DataSourceSettings, DataType};
use crate::data::channel::ChannelRange;
use crate::error::{DeltaError, Result};

#[derive(Debug)]
pub struct EceiLoader {
    cache: Array2<f64>,
    chunk_size: usize,
    num_chunks: usize,
}

impl EceiLoader {
    /// Reads and caches `range.len() * chunk_size * num_chunks` samples from
    /// the configured source file.
    pub fn new(ds: &DataSourceSettings, range: &ChannelRange) -> Result<Self> {
        let n_channels = range.len();
        let total_samples = ds.chunk_size * ds.num_chunks;
        let elem_size = match ds.datatype {
            DataType::Int => 4,
            DataType::Float => 8,
        };
        let needed = n_channels * total_samples * elem_size;

        // A bad source path is an operator mistake, not a transport fault.
        let bytes = fs::read(&ds.source_file).map_err(|e| {
            DeltaError::Configuration(format!(
                "cannot read source file {}: {e}",
                ds.source_file.display()
            ))
        })?;
        if bytes.len() < needed {
            return Err(DeltaError::Configuration(format!(
                "source file {} holds {} bytes, {} channels x {} samples need {}",
                ds.source_file.display(),
                bytes.len(),
                n_channels,
                total_samples,
                needed
            )));
        }

        let mut cache = Array2::zeros((n_channels, total_samples));
        for row in 0..n_channels {
            for col in 0..total_samples {
                let at = (row * total_samples + col) * elem_size;
                cache[[row, col]] = match ds.datatype {
                    DataType::Int => {
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&bytes[at..at + 4]);
                        i32::from_le_bytes(raw) as f64
                    }
                    DataType::Float => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&bytes[at..at + 8]);
                        f64::from_le_bytes(raw)
                    }
                };
            }
        }

        Ok(Self {
            cache,
            chunk_size: ds.chunk_size,
            num_chunks: ds.num_chunks,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn n_channels(&self) -> usize {
        self.cache.nrows()
    }

    /// The `idx`-th (channels × chunk_size) slice of the archive.
    pub fn chunk(&self, idx: usize) -> Result<ArrayView2<'_, f64>> {
        if idx >= self.num_chunks {
            return Err(DeltaError::Configuration(format!(
                "chunk {idx} requested, archive has {}",
                self.num_chunks
            )));
        }
        let start = idx * self.chunk_size;
        Ok(self
            .cache
            .slice(ndarray::s![.., start..start + self.chunk_size]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_archive(values: &[f64]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for v in values {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn settings(path: &std::path::Path, chunk_size: usize, num_chunks: usize) -> DataSourceSettings {
        DataSourceSettings {
            source_file: path.to_path_buf(),
            chunk_size,
            num_chunks,
            channel_range: vec!["L0101-L0102".into()],
            datatype: DataType::Float,
        }
    }

    #[test]
    fn chunks_slice_the_archive_in_order() {
        let range: ChannelRange = "L0101-L0102".parse().unwrap();
        // 2 channels x 6 samples, 3 chunks of 2.
        let values: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let file = write_archive(&values);
        let loader = EceiLoader::new(&settings(file.path(), 2, 3), &range).unwrap();
        assert_eq!(loader.n_channels(), 2);
        let chunk1 = loader.chunk(1).unwrap();
        assert_eq!(chunk1[[0, 0]], 2.0);
        assert_eq!(chunk1[[1, 1]], 9.0);
        assert!(loader.chunk(3).is_err());
    }

    #[test]
    fn short_archives_are_rejected() {
        let range: ChannelRange = "L0101-L0102".parse().unwrap();
        let values: Vec<f64> = (0..4).map(|v| v as f64).collect();
        let file = write_archive(&values);
        let err = EceiLoader::new(&settings(file.path(), 2, 3), &range).unwrap_err();
        assert!(matches!(err, DeltaError::Configuration(_)));
    }

    #[test]
    fn missing_archives_are_a_configuration_error() {
        let range: ChannelRange = "L0101-L0102".parse().unwrap();
        let ds = settings(std::path::Path::new("/no/such/archive.bin"), 2, 3);
        let err = EceiLoader::new(&ds, &range).unwrap_err();
        assert!(matches!(err, DeltaError::Configuration(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn int_archives_are_widened_to_f64() {
        let range: ChannelRange = "L0101-L0101".parse().unwrap();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for v in [-3i32, 7, 40000, -40000] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        f.flush().unwrap();
        let mut ds = settings(f.path(), 2, 2);
        ds.datatype = DataType::Int;
        ds.channel_range = vec!["L0101-L0101".into()];
        let loader = EceiLoader::new(&ds, &range).unwrap();
        assert_eq!(loader.chunk(0).unwrap()[[0, 0]], -3.0);
        assert_eq!(loader.chunk(1).unwrap()[[0, 0]], 40000.0);
    }
}
