//! Configuration management for the pipeline.
//!
//! This module defines the data structures for a run configuration, which is
//! loaded from a JSON or TOML file. It uses the `config` crate to handle file
//! loading and deserialization and `serde` for the data structures.
//!
//! ## Schema
//!
//! A run configuration has five sections:
//!
//! - **`diagnostic`**: which diagnostic produced the data (`kstarecei` is the
//!   only implemented one), the shot number, acquisition parameters
//!   (`TriggerTime`, `SampleRate` in kHz, the `t_norm` warm-up window) and
//!   the data source the generator reads from.
//! - **`transport`**: the streaming engine (`bp4`, `dataman`, `sst`), the
//!   channel range published on the stream and engine-specific parameters.
//! - **`fft_params`**: the short-time Fourier transform setup (`nfft`,
//!   `window`, `overlap` fraction, `detrend`). The sampling rate is filled in
//!   from the diagnostic section.
//! - **`task_list`**: one entry per cross-channel analysis to run on every
//!   chunk, with its reference and cross channel ranges.
//! - **`storage`**: which backend results go to (`numpy`, `mongo`, `null`)
//!   and where.
//!
//! ## Validation
//!
//! `Settings::from_file` loads and deserializes the configuration, then calls
//! [`Settings::validate`], which checks the parts that pass deserialization
//! but can still be semantically wrong: channel-range grammar, window
//! overlap bounds, task analysis names, warm-up interval ordering. If
//! validation fails the process does not start; the processor never discovers
//! a bad configuration mid-stream.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analysis::kernel::AnalysisKind;
use crate::data::channel::ChannelRange;
use crate::error::{DeltaError, Result};

/// Frozen run configuration. Constructed once at startup and shared
/// read-only through [`crate::context::RunContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub diagnostic: DiagnosticSettings,
    pub transport: TransportSettings,
    pub fft_params: FftSettings,
    pub task_list: Vec<TaskSettings>,
    pub storage: StorageSettings,
    /// Processor-local tuning knobs. All defaulted; absent in most configs.
    #[serde(default)]
    pub processor: ProcessorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticSettings {
    pub name: DiagnosticKind,
    pub shotnr: u32,
    pub parameters: DiagnosticParameters,
    pub datasource: DataSourceSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Kstarecei,
    Nstxgpi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticParameters {
    /// `[t_start, t_end, _]` in seconds relative to the plasma trigger.
    /// The alias covers loaders that fold keys to lowercase.
    #[serde(rename = "TriggerTime", alias = "triggertime")]
    pub trigger_time: [f64; 3],
    /// Sampling rate in kHz.
    #[serde(rename = "SampleRate", alias = "samplerate")]
    pub sample_rate: f64,
    /// Warm-up window `[t0, t1]` used to estimate per-channel offsets.
    pub t_norm: [f64; 2],
}

impl DiagnosticParameters {
    /// Sampling rate in Hz.
    pub fn f_sample(&self) -> f64 {
        self.sample_rate * 1e3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSettings {
    pub source_file: PathBuf,
    /// Samples per chunk, per channel.
    pub chunk_size: usize,
    /// Number of chunks the generator publishes before closing the stream.
    pub num_chunks: usize,
    /// Channel ranges to read; one entry per generator process.
    pub channel_range: Vec<String>,
    pub datatype: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub engine: EngineKind,
    /// Channel ranges subscribed to; one entry per processor process.
    pub channel_range: Vec<String>,
    #[serde(default)]
    pub params: TransportParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Bp4,
    Dataman,
    Sst,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportParams {
    /// Directory the bp4 engine spools steps into. Defaults to
    /// `<stream name>.bp` under the working directory.
    pub path: Option<PathBuf>,
    /// Pause between generator steps, in milliseconds.
    pub step_delay_ms: u64,
    /// Reader poll interval while waiting for the next step.
    pub poll_interval_ms: Option<u64>,
    /// How long the reader waits for the stream to appear before giving up.
    pub open_timeout_ms: Option<u64>,
}

impl TransportParams {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.unwrap_or(20))
    }

    pub fn open_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.open_timeout_ms.unwrap_or(30_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FftSettings {
    pub nfft: usize,
    pub window: WindowKind,
    /// Overlap between consecutive blocks as a fraction of `nfft`,
    /// `0.0 <= overlap < 1.0`.
    pub overlap: f64,
    pub detrend: DetrendKind,
    /// Filled from `diagnostic.parameters.SampleRate` when absent.
    #[serde(default)]
    pub fsample: Option<f64>,
    /// Scale spectra by `1/sqrt(sum(window^2))` so power is comparable
    /// across window kinds.
    #[serde(default = "default_true")]
    pub normalize_scale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Hann,
    Hamming,
    Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetrendKind {
    None,
    Constant,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Analysis name; resolved to [`AnalysisKind`] during validation so that
    /// a typo is reported as `UnknownAnalysis` before the stream opens.
    pub analysis: String,
    #[serde(default)]
    pub description: String,
    pub kwargs: TaskKwargs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskKwargs {
    pub ref_channels: Vec<String>,
    pub x_channels: Vec<String>,
    /// Keep the frequency axis of pairwise spectra instead of collapsing
    /// to a scalar.
    #[serde(default)]
    pub per_bin: bool,
    /// Wavenumber bins for the spectral-wavenumber analysis.
    #[serde(default)]
    pub nk: Option<usize>,
    /// Channel separation used for the local wavenumber estimate.
    #[serde(default)]
    pub dz: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub backend: BackendKind,
    /// Where the mongo backend keeps result arrays.
    #[serde(default)]
    pub datastore: Option<DatastoreKind>,
    /// Root directory for on-disk result blobs.
    #[serde(default)]
    pub datadir: Option<PathBuf>,
    /// Connection string for the mongo backend.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Numpy,
    Mongo,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    /// Result arrays live inside the index documents.
    Inline,
    /// Result arrays are spooled to `.npz` files next to the documents.
    Numpy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Capacity of the receiver → consumer chunk queue.
    pub queue_capacity: usize,
    /// Number of parallel kernel workers.
    pub n_workers: usize,
    /// Throttles the consumer loop by this many milliseconds per chunk.
    /// Zero in production; nonzero when exercising back-pressure.
    pub chunk_delay_ms: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            n_workers: default_n_workers(),
            chunk_delay_ms: 0,
        }
    }
}

fn default_queue_capacity() -> usize {
    16
}

fn default_n_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Loads a run configuration from `path` (format inferred from the
    /// extension) and validates it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the semantic constraints that deserialization cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.diagnostic.name != DiagnosticKind::Kstarecei {
            return Err(DeltaError::Configuration(format!(
                "diagnostic {:?} is not implemented",
                self.diagnostic.name
            )));
        }
        let params = &self.diagnostic.parameters;
        if params.sample_rate <= 0.0 {
            return Err(DeltaError::Configuration(
                "SampleRate must be positive".into(),
            ));
        }
        if params.t_norm[0] >= params.t_norm[1] {
            return Err(DeltaError::Configuration(format!(
                "t_norm interval is empty: [{}, {}]",
                params.t_norm[0], params.t_norm[1]
            )));
        }
        let ds = &self.diagnostic.datasource;
        if ds.chunk_size == 0 || ds.num_chunks == 0 {
            return Err(DeltaError::Configuration(
                "chunk_size and num_chunks must be positive".into(),
            ));
        }
        if ds.channel_range.is_empty() {
            return Err(DeltaError::Configuration(
                "datasource.channel_range must name at least one range".into(),
            ));
        }
        if self.transport.channel_range.is_empty() {
            return Err(DeltaError::Configuration(
                "transport.channel_range must name at least one range".into(),
            ));
        }
        for s in ds
            .channel_range
            .iter()
            .chain(self.transport.channel_range.iter())
        {
            s.parse::<ChannelRange>()?;
        }

        if self.fft_params.nfft == 0 {
            return Err(DeltaError::BadFftParams("nfft must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.fft_params.overlap) {
            return Err(DeltaError::BadFftParams(format!(
                "overlap must be in [0, 1), got {}",
                self.fft_params.overlap
            )));
        }

        if self.task_list.is_empty() {
            return Err(DeltaError::Configuration("task_list is empty".into()));
        }
        for task in &self.task_list {
            task.analysis.parse::<AnalysisKind>()?;
            for (key, ranges) in [
                ("ref_channels", &task.kwargs.ref_channels),
                ("x_channels", &task.kwargs.x_channels),
            ] {
                let first = ranges.first().ok_or_else(|| {
                    DeltaError::Configuration(format!(
                        "task '{}' is missing {}",
                        task.analysis, key
                    ))
                })?;
                first.parse::<ChannelRange>()?;
            }
            if let Some(0) = task.kwargs.nk {
                return Err(DeltaError::Configuration(format!(
                    "task '{}': nk must be positive",
                    task.analysis
                )));
            }
        }

        if self.processor.queue_capacity < 2 {
            return Err(DeltaError::Configuration(
                "processor.queue_capacity must be at least 2".into(),
            ));
        }
        if self.processor.n_workers == 0 {
            return Err(DeltaError::Configuration(
                "processor.n_workers must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The sampling rate the STFT runs at, in Hz.
    pub fn f_sample(&self) -> f64 {
        self.fft_params
            .fsample
            .unwrap_or_else(|| self.diagnostic.parameters.f_sample())
    }
}
