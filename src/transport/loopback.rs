//! In-process stream engine.
//!
//! Pairs a writer and a reader over a bounded channel inside one process.
//! Used by the integration tests and by single-host runs that do not need a
//! spool directory. Semantics mirror the file engine: a header published at
//! open carries the variables and attributes, every step is one frame, and
//! closing the writer delivers end-of-stream after all published steps are
//! consumed. A full channel blocks the writer, which is exactly the
//! back-pressure the generator is expected to see.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::error::{DeltaError, Result};
use crate::transport::{Dtype, StepStatus, StreamReader, StreamWriter, VarInfo};

enum Packet {
    Header {
        vars: HashMap<String, Vec<usize>>,
        attrs: HashMap<String, String>,
    },
    Step {
        tidx: u64,
        frames: HashMap<String, Vec<f64>>,
    },
    Eof,
}

/// Creates a connected writer/reader pair with the given in-flight step
/// capacity.
pub fn pair(capacity: usize) -> (LoopbackWriter, LoopbackReader) {
    let (tx, rx) = sync_channel(capacity);
    (
        LoopbackWriter {
            tx,
            vars: HashMap::new(),
            attrs: HashMap::new(),
            opened: false,
            step: 0,
            pending: None,
        },
        LoopbackReader {
            rx,
            vars: HashMap::new(),
            attrs: HashMap::new(),
            opened: false,
            current: 0,
            frames: None,
        },
    )
}

pub struct LoopbackWriter {
    tx: SyncSender<Packet>,
    vars: HashMap<String, Vec<usize>>,
    attrs: HashMap<String, String>,
    opened: bool,
    step: u64,
    pending: Option<HashMap<String, Vec<f64>>>,
}

impl LoopbackWriter {
    fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| DeltaError::Transport("loopback reader is gone".into()))
    }
}

impl StreamWriter for LoopbackWriter {
    fn define_variable(&mut self, name: &str, shape: &[usize]) -> Result<()> {
        if self.opened {
            return Err(DeltaError::Transport("define_variable after open".into()));
        }
        self.vars.insert(name.to_string(), shape.to_vec());
        Ok(())
    }

    fn define_attribute(&mut self, name: &str, json: &str) -> Result<()> {
        if self.opened {
            return Err(DeltaError::Transport("define_attribute after open".into()));
        }
        self.attrs.insert(name.to_string(), json.to_string());
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        self.send(Packet::Header {
            vars: self.vars.clone(),
            attrs: self.attrs.clone(),
        })?;
        self.opened = true;
        Ok(())
    }

    fn begin_step(&mut self) -> Result<()> {
        if !self.opened {
            return Err(DeltaError::Transport("begin_step before open".into()));
        }
        if self.pending.is_some() {
            return Err(DeltaError::Transport("nested begin_step".into()));
        }
        self.pending = Some(HashMap::new());
        Ok(())
    }

    fn put(&mut self, name: &str, data: &[f64]) -> Result<()> {
        let shape = self.vars.get(name).ok_or_else(|| {
            DeltaError::Transport(format!("put of undefined variable '{name}'"))
        })?;
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DeltaError::Transport(format!(
                "frame for '{name}' has {} elements, variable declares {expected}",
                data.len()
            )));
        }
        self.pending
            .as_mut()
            .ok_or_else(|| DeltaError::Transport("put outside a step".into()))?
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn end_step(&mut self) -> Result<()> {
        let frames = self
            .pending
            .take()
            .ok_or_else(|| DeltaError::Transport("end_step outside a step".into()))?;
        // Blocks when the channel is full; the generator slows to the
        // consumer's pace.
        self.send(Packet::Step {
            tidx: self.step,
            frames,
        })?;
        self.step += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.opened {
            self.send(Packet::Eof)?;
        }
        Ok(())
    }
}

pub struct LoopbackReader {
    rx: Receiver<Packet>,
    vars: HashMap<String, Vec<usize>>,
    attrs: HashMap<String, String>,
    opened: bool,
    current: u64,
    frames: Option<HashMap<String, Vec<f64>>>,
}

impl LoopbackReader {
    fn recv(&self) -> Result<Packet> {
        self.rx
            .recv()
            .map_err(|_| DeltaError::Transport("loopback writer vanished mid-stream".into()))
    }
}

impl StreamReader for LoopbackReader {
    fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        match self.recv()? {
            Packet::Header { vars, attrs } => {
                self.vars = vars;
                self.attrs = attrs;
                self.opened = true;
                Ok(())
            }
            _ => Err(DeltaError::Transport(
                "loopback stream did not start with a header".into(),
            )),
        }
    }

    fn begin_step(&mut self) -> Result<StepStatus> {
        if !self.opened {
            return Err(DeltaError::Transport("begin_step before open".into()));
        }
        if self.frames.is_some() {
            return Err(DeltaError::Transport("nested begin_step".into()));
        }
        match self.recv()? {
            Packet::Step { tidx, frames } => {
                self.current = tidx;
                self.frames = Some(frames);
                Ok(StepStatus::Step(tidx))
            }
            Packet::Eof => Ok(StepStatus::EndOfStream),
            Packet::Header { .. } => {
                Err(DeltaError::Transport("unexpected second header".into()))
            }
        }
    }

    fn current_step(&self) -> u64 {
        self.current
    }

    fn inquire_variable(&mut self, name: &str) -> Result<VarInfo> {
        let shape = self.vars.get(name).ok_or_else(|| {
            DeltaError::Transport(format!("stream has no variable '{name}'"))
        })?;
        Ok(VarInfo {
            name: name.to_string(),
            shape: shape.clone(),
            dtype: Dtype::Float64,
        })
    }

    fn get(&mut self, name: &str, dest: &mut [f64]) -> Result<()> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| DeltaError::Transport("get outside a step".into()))?;
        let data = frames.get(name).ok_or_else(|| {
            DeltaError::Transport(format!("step {} has no frame for '{name}'", self.current))
        })?;
        if dest.len() != data.len() {
            return Err(DeltaError::Transport(format!(
                "destination holds {} elements, frame has {}",
                dest.len(),
                data.len()
            )));
        }
        dest.copy_from_slice(data);
        Ok(())
    }

    fn inquire_attribute(&mut self, name: &str) -> Result<String> {
        self.attrs.get(name).cloned().ok_or_else(|| {
            DeltaError::Transport(format!("stream has no attribute '{name}'"))
        })
    }

    fn end_step(&mut self) -> Result<()> {
        self.frames
            .take()
            .map(|_| ())
            .ok_or_else(|| DeltaError::Transport("end_step outside a step".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_flow_writer_to_reader() {
        let (mut writer, mut reader) = pair(4);
        writer.define_variable("v", &[1, 3]).unwrap();
        writer.define_attribute("cfg", "{}").unwrap();
        writer.open().unwrap();
        for step in 0..2u64 {
            writer.begin_step().unwrap();
            writer
                .put("v", &[step as f64, 1.0, 2.0])
                .unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();

        reader.open().unwrap();
        assert_eq!(reader.inquire_attribute("cfg").unwrap(), "{}");
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Step(0));
        let mut frame = [0.0; 3];
        reader.get("v", &mut frame).unwrap();
        assert_eq!(frame, [0.0, 1.0, 2.0]);
        reader.end_step().unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::Step(1));
        reader.end_step().unwrap();
        assert_eq!(reader.begin_step().unwrap(), StepStatus::EndOfStream);
    }

    #[test]
    fn vanishing_writer_is_a_transport_error() {
        let (writer, mut reader) = pair(4);
        {
            let mut writer = writer;
            writer.define_variable("v", &[1]).unwrap();
            writer.open().unwrap();
            // Dropped without close().
        }
        reader.open().unwrap();
        assert!(matches!(
            reader.begin_step(),
            Err(DeltaError::Transport(_))
        ));
    }

    #[test]
    fn full_channel_blocks_the_writer() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let (mut writer, mut reader) = pair(1);
        writer.define_variable("v", &[1]).unwrap();
        writer.open().unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..3 {
                writer.begin_step().unwrap();
                writer.put("v", &[0.0]).unwrap();
                writer.end_step().unwrap();
            }
            flag.store(true, Ordering::SeqCst);
        });

        // Header + one step fill the channel; the writer cannot finish
        // until the reader drains.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!finished.load(Ordering::SeqCst));

        reader.open().unwrap();
        for _ in 0..3 {
            assert!(matches!(
                reader.begin_step().unwrap(),
                StepStatus::Step(_)
            ));
            reader.end_step().unwrap();
        }
        handle.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
