//! Declarative analysis tasks.
//!
//! An [`AnalysisTask`] names one analysis kind and the two channel ranges it
//! runs over. It is stateless: per chunk it expands into the *dispatch
//! sequence*, the ordered cartesian product of reference and cross channels
//! (reference-major, cross-minor). That ordering is a contract — the i-th
//! result row delivered to storage belongs to the i-th pair — and the
//! serialized sequence stored with the run metadata is the only way a later
//! consumer can re-associate result rows with channel pairs.

use serde::{Deserialize, Serialize};

use crate::analysis::kernel::{result_shape, AnalysisKind, KernelOpts};
use crate::analysis::stft::FftParams;
use crate::config::TaskSettings;
use crate::data::channel::{Channel, ChannelRange};
use crate::error::{DeltaError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTask {
    pub kind: AnalysisKind,
    pub description: String,
    pub ref_range: ChannelRange,
    pub cross_range: ChannelRange,
    pub opts: KernelOpts,
}

impl AnalysisTask {
    pub fn from_settings(ts: &TaskSettings) -> Result<Self> {
        let kind: AnalysisKind = ts.analysis.parse()?;
        let ref_range = first_range(&ts.kwargs.ref_channels, &ts.analysis, "ref_channels")?;
        let cross_range = first_range(&ts.kwargs.x_channels, &ts.analysis, "x_channels")?;
        let defaults = KernelOpts::default();
        Ok(Self {
            kind,
            description: ts.description.clone(),
            ref_range,
            cross_range,
            opts: KernelOpts {
                per_bin: ts.kwargs.per_bin,
                nk: ts.kwargs.nk.unwrap_or(defaults.nk),
                dz: ts.kwargs.dz.unwrap_or(defaults.dz),
            },
        })
    }

    /// Task name used to key stored results.
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Number of results the task produces per chunk.
    pub fn num_pairs(&self) -> usize {
        self.ref_range.len() * self.cross_range.len()
    }

    /// The ordered pair sequence, reference-major and cross-minor.
    pub fn dispatch_sequence(&self) -> Vec<(Channel, Channel)> {
        let mut pairs = Vec::with_capacity(self.num_pairs());
        for r in self.ref_range.iter() {
            for c in self.cross_range.iter() {
                pairs.push((r, c));
            }
        }
        pairs
    }

    /// Shape of one pair's result under the given transform parameters.
    pub fn result_shape(&self, params: &FftParams) -> Vec<usize> {
        result_shape(self.kind, params, &self.opts)
    }
}

fn first_range(ranges: &[String], task: &str, key: &str) -> Result<ChannelRange> {
    ranges
        .first()
        .ok_or_else(|| DeltaError::Configuration(format!("task '{task}' is missing {key}")))?
        .parse()
}

/// One task's entry in the serialized dispatch sequence stored with the run
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSeqEntry {
    pub analysis: String,
    pub ref_channels: String,
    pub cross_channels: String,
    /// `[reference, cross]` channel name pairs in dispatch order.
    pub pairs: Vec<(String, String)>,
}

impl DispatchSeqEntry {
    pub fn from_task(task: &AnalysisTask) -> Self {
        Self {
            analysis: task.name().to_string(),
            ref_channels: task.ref_range.to_string(),
            cross_channels: task.cross_range.to_string(),
            pairs: task
                .dispatch_sequence()
                .into_iter()
                .map(|(r, c)| (r.to_string(), c.to_string()))
                .collect(),
        }
    }
}

/// Serializes the dispatch sequences of all configured tasks, one entry per
/// task, in task order.
pub fn serialize_dispatch_seq(tasks: &[AnalysisTask]) -> Vec<DispatchSeqEntry> {
    tasks.iter().map(DispatchSeqEntry::from_task).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TaskKwargs, TaskSettings};

    fn task_settings(analysis: &str, refs: &str, crosses: &str) -> TaskSettings {
        TaskSettings {
            analysis: analysis.into(),
            description: String::new(),
            kwargs: TaskKwargs {
                ref_channels: vec![refs.into()],
                x_channels: vec![crosses.into()],
                per_bin: false,
                nk: None,
                dz: None,
            },
        }
    }

    #[test]
    fn dispatch_sequence_is_ref_major_cross_minor() {
        let task =
            AnalysisTask::from_settings(&task_settings("cross_phase", "L0101-L0102", "L0201-L0202"))
                .unwrap();
        let seq: Vec<(String, String)> = task
            .dispatch_sequence()
            .into_iter()
            .map(|(r, c)| (r.to_string(), c.to_string()))
            .collect();
        assert_eq!(
            seq,
            [
                ("L0101".to_string(), "L0201".to_string()),
                ("L0101".to_string(), "L0202".to_string()),
                ("L0102".to_string(), "L0201".to_string()),
                ("L0102".to_string(), "L0202".to_string()),
            ]
        );
        assert_eq!(task.num_pairs(), seq.len());
    }

    #[test]
    fn pair_count_is_the_product_of_the_range_sizes() {
        let task =
            AnalysisTask::from_settings(&task_settings("coherence", "L0101-L0308", "L0501-L0504"))
                .unwrap();
        assert_eq!(task.num_pairs(), 24 * 4);
        assert_eq!(task.dispatch_sequence().len(), 24 * 4);
    }

    #[test]
    fn unknown_analysis_fails_task_construction() {
        let err =
            AnalysisTask::from_settings(&task_settings("cwt", "L0101-L0101", "L0101-L0101"))
                .unwrap_err();
        assert!(matches!(err, DeltaError::UnknownAnalysis(_)));
    }

    #[test]
    fn dispatch_sequence_roundtrips_through_json() {
        let tasks = vec![
            AnalysisTask::from_settings(&task_settings("cross_phase", "L0101-L0104", "L0101-L0104"))
                .unwrap(),
            AnalysisTask::from_settings(&task_settings("cross_power", "L0102-L0103", "L0201-L0202"))
                .unwrap(),
        ];
        let seq = serialize_dispatch_seq(&tasks);
        let json = serde_json::to_string(&seq).unwrap();
        let parsed: Vec<DispatchSeqEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, seq);

        // The wire format is one object per task with [ref, cross] pairs.
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["analysis"], "cross_phase");
        assert_eq!(value[0]["ref_channels"], "L0101-L0104");
        assert_eq!(value[0]["pairs"][0], serde_json::json!(["L0101", "L0101"]));
        assert_eq!(value[1]["pairs"].as_array().unwrap().len(), 4);
    }
}
