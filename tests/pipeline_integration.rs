//! End-to-end pipeline tests over the loopback transport.
//!
//! Covers the core streaming contracts: the end-of-stream drain, the
//! pre-warmup drop rule, per-chunk result counts and ordering, and the
//! single-pair cross-phase measurement pinned by the processing chain's
//! numeric conventions.

use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;

use delta_fusion::analysis::stft::{FftParams, Stft};
use delta_fusion::analysis::task::AnalysisTask;
use delta_fusion::config::Settings;
use delta_fusion::data::channel::ChannelRange;
use delta_fusion::data::chunk::ChunkFactory;
use delta_fusion::data::normalizer::Normalizer;
use delta_fusion::pipeline::{Dispatcher, Executor, Pipeline};
use delta_fusion::storage::{numpy::NumpyBackend, StorageBackend};
use delta_fusion::transport::loopback::{self, LoopbackWriter};
use delta_fusion::transport::StreamWriter;

const FSAMPLE: f64 = 500e3;
const CHUNK_SIZE: usize = 1024;

/// Two-channel settings: one chunk-sized warm-up window at the start of the
/// acquisition, nfft 256 with half-overlap Hann.
fn two_channel_settings(num_chunks: usize, t_norm: [f64; 2]) -> Settings {
    serde_json::from_value(serde_json::json!({
        "diagnostic": {
            "name": "kstarecei",
            "shotnr": 18431,
            "parameters": {
                "TriggerTime": [0.0, 61.1, 60.0],
                "SampleRate": 500,
                "t_norm": t_norm
            },
            "datasource": {
                "source_file": "/dev/null",
                "chunk_size": CHUNK_SIZE,
                "num_chunks": num_chunks,
                "channel_range": ["L0101-L0102"],
                "datatype": "float"
            }
        },
        "transport": {
            "engine": "bp4",
            "channel_range": ["L0101-L0102"]
        },
        "fft_params": {
            "nfft": 256,
            "window": "hann",
            "overlap": 0.5,
            "detrend": "constant"
        },
        "task_list": [
            {
                "analysis": "cross_phase",
                "description": "single pair cross phase",
                "kwargs": {
                    "ref_channels": ["L0101-L0101"],
                    "x_channels": ["L0102-L0102"]
                }
            }
        ],
        "storage": {"backend": "null"}
    }))
    .unwrap()
}

fn build_pipeline(
    settings: &Settings,
    backend: Arc<dyn StorageBackend>,
) -> (Pipeline, Vec<AnalysisTask>) {
    let stream_range: ChannelRange = settings.transport.channel_range[0].parse().unwrap();
    let tasks: Vec<AnalysisTask> = settings
        .task_list
        .iter()
        .map(|t| AnalysisTask::from_settings(t).unwrap())
        .collect();
    let dispatcher = Dispatcher::new(stream_range);
    for task in &tasks {
        dispatcher.validate(task).unwrap();
    }
    let params = FftParams::from_settings(&settings.fft_params, settings.f_sample()).unwrap();
    let pipeline = Pipeline::new(
        ChunkFactory::new(&settings.diagnostic, stream_range.len()),
        Normalizer::new(
            settings.diagnostic.parameters.t_norm[0],
            settings.diagnostic.parameters.t_norm[1],
        ),
        Stft::new(params),
        tasks.clone(),
        dispatcher,
        Executor::new(settings.processor.n_workers),
        backend,
        &settings.processor,
        "TEST01".into(),
    );
    (pipeline, tasks)
}

/// Publishes `frames` (each 2 x CHUNK_SIZE, row-major) as consecutive steps
/// and closes the stream.
fn publish_frames(mut writer: LoopbackWriter, frames: Vec<Vec<f64>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        writer
            .define_variable("L0101-L0102", &[2, CHUNK_SIZE])
            .unwrap();
        writer.define_attribute("cfg", "{}").unwrap();
        writer.open().unwrap();
        for frame in frames {
            writer.begin_step().unwrap();
            writer.put("L0101-L0102", &frame).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    })
}

/// One frame with a 50 kHz tone on both channels, the cross channel
/// trailing by `phase_lag`, riding on distinct per-channel offsets so the
/// normalizer has something to estimate.
fn tone_frame(phase_lag: f64) -> Vec<f64> {
    let mut frame = Vec::with_capacity(2 * CHUNK_SIZE);
    for i in 0..CHUNK_SIZE {
        let t = i as f64 / FSAMPLE;
        frame.push(2.0 + (2.0 * PI * 50e3 * t).cos());
    }
    for i in 0..CHUNK_SIZE {
        let t = i as f64 / FSAMPLE;
        frame.push(3.0 + (2.0 * PI * 50e3 * t - phase_lag).cos());
    }
    frame
}

#[tokio::test]
async fn eof_drains_with_all_chunks_stored() {
    // Three chunks, then end-of-stream. Warm-up window sits inside chunk 0,
    // so every chunk is analyzed.
    let settings = two_channel_settings(3, [0.0, 0.0005]);
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(NumpyBackend::new(tmp.path(), "TEST01").unwrap());

    let (writer, reader) = loopback::pair(8);
    let producer = publish_frames(writer, vec![tone_frame(0.3); 3]);

    let (pipeline, _) = build_pipeline(&settings, backend.clone());
    let stats = pipeline
        .run(Box::new(reader), "L0101-L0102".into())
        .await
        .unwrap();
    producer.join().unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.dropped_prewarmup, 0);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.stored, 3);
    assert_eq!(stats.kernel_failures, 0);
    assert_eq!(stats.storage_failures, 0);

    // One blob per (task, chunk), with every tidx covered exactly once.
    let catalog = std::fs::read_to_string(backend.dir().join("catalog.jsonl")).unwrap();
    let mut tidxs: Vec<u64> = catalog
        .lines()
        .map(|line| {
            let doc: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(doc["task_name"], "cross_phase");
            doc["tidx"].as_u64().unwrap()
        })
        .collect();
    tidxs.sort_unstable();
    assert_eq!(tidxs, [0, 1, 2]);
}

#[tokio::test]
async fn chunks_before_the_warmup_window_are_dropped() {
    // The warm-up window lies inside chunk 1; chunk 0 must be dropped and
    // produce no results.
    let t0 = CHUNK_SIZE as f64 / FSAMPLE;
    let settings = two_channel_settings(3, [t0, t0 + 0.0005]);
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(NumpyBackend::new(tmp.path(), "TEST01").unwrap());

    let (writer, reader) = loopback::pair(8);
    let producer = publish_frames(writer, vec![tone_frame(0.3); 3]);

    let (pipeline, _) = build_pipeline(&settings, backend.clone());
    let stats = pipeline
        .run(Box::new(reader), "L0101-L0102".into())
        .await
        .unwrap();
    producer.join().unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.dropped_prewarmup, 1);
    assert_eq!(stats.stored, 2);

    let catalog = std::fs::read_to_string(backend.dir().join("catalog.jsonl")).unwrap();
    for line in catalog.lines() {
        let doc: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_ne!(doc["tidx"].as_u64().unwrap(), 0, "chunk 0 must not be stored");
    }
}

#[tokio::test]
async fn single_pair_cross_phase_measures_the_lag() {
    // 50 kHz on both channels, cross trailing by pi/4: the stored scalar
    // must come out at -pi/4.
    let settings = two_channel_settings(1, [0.0, 0.0005]);
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(NumpyBackend::new(tmp.path(), "TEST01").unwrap());

    let (writer, reader) = loopback::pair(4);
    let producer = publish_frames(writer, vec![tone_frame(PI / 4.0)]);

    let (pipeline, _) = build_pipeline(&settings, backend.clone());
    let stats = pipeline
        .run(Box::new(reader), "L0101-L0102".into())
        .await
        .unwrap();
    producer.join().unwrap();
    assert_eq!(stats.stored, 1);

    let catalog = std::fs::read_to_string(backend.dir().join("catalog.jsonl")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(catalog.lines().next().unwrap()).unwrap();
    let blob = backend.dir().join(doc["blob_ref"].as_str().unwrap());
    let mut npz = ndarray_npy::NpzReader::new(std::fs::File::open(blob).unwrap()).unwrap();
    let data: ndarray::ArrayD<f64> = npz.by_name("data.npy").unwrap();
    assert_eq!(data.shape(), [1]);
    let phase = data[[0]];
    assert!(
        (phase + PI / 4.0).abs() < 1e-3,
        "cross phase {phase}, expected {}",
        -PI / 4.0
    );
}
