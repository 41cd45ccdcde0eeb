//! Stepwise stream transport.
//!
//! The generator and processor talk through a pub/sub byte channel with a
//! step-oriented API: the writer defines a variable and a JSON attribute at
//! open, then publishes one framed (channels × samples) array per step; the
//! reader consumes steps in order and observes end-of-stream as a regular
//! condition, not an error.
//!
//! The engine actually moving the bytes is pluggable. `bp4` spools steps
//! through a directory ([`file`]); [`loopback`] pairs a writer and reader in
//! one process for tests and single-host runs. The `dataman` and `sst`
//! engines of the upstream deployment are recognized in configuration but
//! not built into this binary.

pub mod file;
pub mod loopback;

use crate::config::{DiagnosticSettings, EngineKind, TransportSettings};
use crate::error::{DeltaError, Result};

/// Outcome of `begin_step` on the reader side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// A step with this index is ready to read.
    Step(u64),
    /// The writer closed the stream; no further steps will arrive.
    EndOfStream,
}

/// Shape and element type of a framed variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl VarInfo {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float64,
}

/// Reader half of the stepwise contract. Calls may block on I/O; the
/// receiver runs it on a blocking thread.
pub trait StreamReader: Send {
    /// Blocks until the stream exists (the generator may start later).
    fn open(&mut self) -> Result<()>;

    /// Blocks until the next step is available or the stream ends.
    /// Step indices are monotonically increasing.
    fn begin_step(&mut self) -> Result<StepStatus>;

    /// Index of the step currently open.
    fn current_step(&self) -> u64;

    fn inquire_variable(&mut self, name: &str) -> Result<VarInfo>;

    /// Reads the current step's frame for `name` into `dest`, which must
    /// hold exactly `VarInfo::len` elements, row-major.
    fn get(&mut self, name: &str, dest: &mut [f64]) -> Result<()>;

    /// JSON attribute defined by the writer at open.
    fn inquire_attribute(&mut self, name: &str) -> Result<String>;

    fn end_step(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn StreamReader>")
    }
}

impl std::fmt::Debug for dyn StreamReader + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn StreamReader + Send>")
    }
}

/// Writer half of the stepwise contract.
pub trait StreamWriter: Send {
    /// Declares the framed variable sent in every subsequent step.
    /// Must be called before `open`.
    fn define_variable(&mut self, name: &str, shape: &[usize]) -> Result<()>;

    /// Attaches a JSON attribute to the stream. Must be called before
    /// `open`.
    fn define_attribute(&mut self, name: &str, json: &str) -> Result<()>;

    fn open(&mut self) -> Result<()>;

    fn begin_step(&mut self) -> Result<()>;

    fn put(&mut self, name: &str, data: &[f64]) -> Result<()>;

    fn end_step(&mut self) -> Result<()>;

    /// Ends the stream; readers observe `EndOfStream` once all published
    /// steps are consumed.
    fn close(&mut self) -> Result<()>;
}

/// Descriptive stream name, `<experiment>_<shotnr>_ECEI_<range>`.
pub fn stream_name(diag: &DiagnosticSettings) -> String {
    format!(
        "KSTAR_{:05}_ECEI_{}",
        diag.shotnr,
        diag.datasource
            .channel_range
            .first()
            .map(String::as_str)
            .unwrap_or("")
    )
}

/// Constructs the configured reader engine.
pub fn open_reader(
    cfg: &TransportSettings,
    stream: &str,
) -> Result<Box<dyn StreamReader + Send>> {
    match cfg.engine {
        EngineKind::Bp4 => Ok(Box::new(file::FileStreamReader::new(cfg, stream))),
        EngineKind::Dataman | EngineKind::Sst => Err(unsupported_engine(cfg.engine)),
    }
}

/// Constructs the configured writer engine.
pub fn open_writer(
    cfg: &TransportSettings,
    stream: &str,
) -> Result<Box<dyn StreamWriter + Send>> {
    match cfg.engine {
        EngineKind::Bp4 => Ok(Box::new(file::FileStreamWriter::new(cfg, stream))),
        EngineKind::Dataman | EngineKind::Sst => Err(unsupported_engine(cfg.engine)),
    }
}

fn unsupported_engine(engine: EngineKind) -> DeltaError {
    DeltaError::Configuration(format!(
        "transport engine {engine:?} is not built into this binary; use bp4"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;

    #[test]
    fn stream_names_carry_shot_and_range() {
        let settings = test_settings();
        assert_eq!(
            stream_name(&settings.diagnostic),
            "KSTAR_18431_ECEI_L0101-L2408"
        );
    }

    #[test]
    fn unsupported_engines_are_a_configuration_error() {
        let mut settings = test_settings();
        settings.transport.engine = EngineKind::Dataman;
        let err = open_reader(&settings.transport, "s").unwrap_err();
        assert!(matches!(err, DeltaError::Configuration(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
