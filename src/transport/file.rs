//! File-spooled stream engine (the `bp4` configuration).
//!
//! The writer turns a stream into a directory: a `stream.json` document
//! describing the variables and attributes, one raw little-endian frame file
//! per step, and a `stream.done` marker once the stream is closed. Frame
//! files are written to a temporary name and renamed into place, so a
//! polling reader only ever observes complete steps.
//!
//! The reader blocks in `open` until the directory and its metadata appear,
//! and in `begin_step` until the next step file lands or the done marker is
//! the only thing left to see.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::TransportSettings;
use crate::error::{DeltaError, Result};
use crate::transport::{Dtype, StepStatus, StreamReader, StreamWriter, VarInfo};

const META_FILE: &str = "stream.json";
const DONE_FILE: &str = "stream.done";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamMeta {
    name: String,
    variables: HashMap<String, VarMeta>,
    attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VarMeta {
    shape: Vec<usize>,
    dtype: Dtype,
}

fn stream_dir(cfg: &TransportSettings, stream: &str) -> PathBuf {
    let base = cfg
        .params
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(format!("{stream}.bp"))
}

fn step_file(dir: &Path, step: u64) -> PathBuf {
    dir.join(format!("step_{step:08}.f64"))
}

pub struct FileStreamWriter {
    dir: PathBuf,
    meta: StreamMeta,
    opened: bool,
    in_step: bool,
    step: u64,
}

impl FileStreamWriter {
    pub fn new(cfg: &TransportSettings, stream: &str) -> Self {
        Self {
            dir: stream_dir(cfg, stream),
            meta: StreamMeta {
                name: stream.to_string(),
                variables: HashMap::new(),
                attributes: HashMap::new(),
            },
            opened: false,
            in_step: false,
            step: 0,
        }
    }
}

impl StreamWriter for FileStreamWriter {
    fn define_variable(&mut self, name: &str, shape: &[usize]) -> Result<()> {
        if self.opened {
            return Err(DeltaError::Transport(
                "define_variable after open".into(),
            ));
        }
        self.meta.variables.insert(
            name.to_string(),
            VarMeta {
                shape: shape.to_vec(),
                dtype: Dtype::Float64,
            },
        );
        Ok(())
    }

    fn define_attribute(&mut self, name: &str, json: &str) -> Result<()> {
        if self.opened {
            return Err(DeltaError::Transport(
                "define_attribute after open".into(),
            ));
        }
        self.meta
            .attributes
            .insert(name.to_string(), json.to_string());
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(&self.meta)
            .map_err(|e| DeltaError::Transport(format!("cannot encode stream metadata: {e}")))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        self.opened = true;
        Ok(())
    }

    fn begin_step(&mut self) -> Result<()> {
        if !self.opened {
            return Err(DeltaError::Transport("begin_step before open".into()));
        }
        if self.in_step {
            return Err(DeltaError::Transport("nested begin_step".into()));
        }
        self.in_step = true;
        Ok(())
    }

    fn put(&mut self, name: &str, data: &[f64]) -> Result<()> {
        if !self.in_step {
            return Err(DeltaError::Transport("put outside a step".into()));
        }
        let var = self.meta.variables.get(name).ok_or_else(|| {
            DeltaError::Transport(format!("put of undefined variable '{name}'"))
        })?;
        let expected: usize = var.shape.iter().product();
        if data.len() != expected {
            return Err(DeltaError::Transport(format!(
                "frame for '{name}' has {} elements, variable declares {expected}",
                data.len()
            )));
        }
        let mut bytes = Vec::with_capacity(data.len() * 8);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let tmp = self.dir.join(format!("step_{:08}.tmp", self.step));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, step_file(&self.dir, self.step))?;
        Ok(())
    }

    fn end_step(&mut self) -> Result<()> {
        if !self.in_step {
            return Err(DeltaError::Transport("end_step outside a step".into()));
        }
        self.in_step = false;
        self.step += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        fs::write(self.dir.join(DONE_FILE), b"")?;
        Ok(())
    }
}

pub struct FileStreamReader {
    dir: PathBuf,
    poll: Duration,
    open_timeout: Duration,
    meta: Option<StreamMeta>,
    next_step: u64,
    current: u64,
    in_step: bool,
}

impl FileStreamReader {
    pub fn new(cfg: &TransportSettings, stream: &str) -> Self {
        Self {
            dir: stream_dir(cfg, stream),
            poll: cfg.params.poll_interval(),
            open_timeout: cfg.params.open_timeout(),
            meta: None,
            next_step: 0,
            current: 0,
            in_step: false,
        }
    }

    fn meta(&self) -> Result<&StreamMeta> {
        self.meta
            .as_ref()
            .ok_or_else(|| DeltaError::Transport("reader used before open".into()))
    }
}

impl StreamReader for FileStreamReader {
    fn open(&mut self) -> Result<()> {
        if self.meta.is_some() {
            return Ok(());
        }
        let deadline = Instant::now() + self.open_timeout;
        let meta_path = self.dir.join(META_FILE);
        loop {
            if meta_path.exists() {
                let body = fs::read(&meta_path)?;
                let meta: StreamMeta = serde_json::from_slice(&body).map_err(|e| {
                    DeltaError::Transport(format!("corrupt stream metadata: {e}"))
                })?;
                self.meta = Some(meta);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeltaError::Transport(format!(
                    "stream {} did not appear within {:?}",
                    self.dir.display(),
                    self.open_timeout
                )));
            }
            std::thread::sleep(self.poll);
        }
    }

    fn begin_step(&mut self) -> Result<StepStatus> {
        self.meta()?;
        if self.in_step {
            return Err(DeltaError::Transport("nested begin_step".into()));
        }
        loop {
            if step_file(&self.dir, self.next_step).exists() {
                self.current = self.next_step;
                self.in_step = true;
                return Ok(StepStatus::Step(self.current));
            }
            // Steps are renamed into place before the done marker is
            // written, so a missing step after the marker means the stream
            // is drained.
            if self.dir.join(DONE_FILE).exists()
                && !step_file(&self.dir, self.next_step).exists()
            {
                return Ok(StepStatus::EndOfStream);
            }
            std::thread::sleep(self.poll);
        }
    }

    fn current_step(&self) -> u64 {
        self.current
    }

    fn inquire_variable(&mut self, name: &str) -> Result<VarInfo> {
        let meta = self.meta()?;
        let var = meta.variables.get(name).ok_or_else(|| {
            DeltaError::Transport(format!("stream has no variable '{name}'"))
        })?;
        Ok(VarInfo {
            name: name.to_string(),
            shape: var.shape.clone(),
            dtype: var.dtype,
        })
    }

    fn get(&mut self, name: &str, dest: &mut [f64]) -> Result<()> {
        if !self.in_step {
            return Err(DeltaError::Transport("get outside a step".into()));
        }
        let expected = self.inquire_variable(name)?.len();
        if dest.len() != expected {
            return Err(DeltaError::Transport(format!(
                "destination holds {} elements, variable '{name}' has {expected}",
                dest.len()
            )));
        }
        let bytes = fs::read(step_file(&self.dir, self.current))?;
        if bytes.len() != expected * 8 {
            return Err(DeltaError::Transport(format!(
                "step {} frame is {} bytes, expected {}",
                self.current,
                bytes.len(),
                expected * 8
            )));
        }
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            dest[i] = f64::from_le_bytes(raw);
        }
        Ok(())
    }

    fn inquire_attribute(&mut self, name: &str) -> Result<String> {
        let meta = self.meta()?;
        meta.attributes.get(name).cloned().ok_or_else(|| {
            DeltaError::Transport(format!("stream has no attribute '{name}'"))
        })
    }

    fn end_step(&mut self) -> Result<()> {
        if !self.in_step {
            return Err(DeltaError::Transport("end_step outside a step".into()));
        }
        self.in_step = false;
        self.next_step = self.current + 1;
        Ok(())
    }
}
