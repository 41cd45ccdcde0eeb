//! Back-pressure through the bounded chunk queue.
//!
//! With a two-slot queue and a consumer throttled to 100 ms per chunk, a
//! fast producer must repeatedly find the queue full and block — and no
//! chunk may be lost while it does.

use std::sync::Arc;
use std::thread;

use delta_fusion::analysis::stft::{FftParams, Stft};
use delta_fusion::analysis::task::AnalysisTask;
use delta_fusion::config::Settings;
use delta_fusion::data::channel::ChannelRange;
use delta_fusion::data::chunk::ChunkFactory;
use delta_fusion::data::normalizer::Normalizer;
use delta_fusion::pipeline::{Dispatcher, Executor, Pipeline};
use delta_fusion::storage::numpy::NumpyBackend;
use delta_fusion::transport::loopback;
use delta_fusion::transport::StreamWriter;

const CHUNK_SIZE: usize = 1024;

fn settings() -> Settings {
    serde_json::from_value(serde_json::json!({
        "diagnostic": {
            "name": "kstarecei",
            "shotnr": 18431,
            "parameters": {
                "TriggerTime": [0.0, 61.1, 60.0],
                "SampleRate": 500,
                "t_norm": [0.0, 0.0005]
            },
            "datasource": {
                "source_file": "/dev/null",
                "chunk_size": CHUNK_SIZE,
                "num_chunks": 5,
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
                "analysis": "cross_power",
                "kwargs": {
                    "ref_channels": ["L0101-L0101"],
                    "x_channels": ["L0102-L0102"]
                }
            }
        ],
        "storage": {"backend": "null"},
        "processor": {
            "queue_capacity": 2,
            "n_workers": 2,
            "chunk_delay_ms": 100
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn full_queue_blocks_the_receiver_without_losing_chunks() {
    let settings = settings();
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(NumpyBackend::new(tmp.path(), "TEST03").unwrap());

    // A generous transport buffer so the producer thread itself never
    // back-pressures; only the pipeline queue can slow the receiver.
    let (mut writer, reader) = loopback::pair(16);
    let producer = thread::spawn(move || {
        writer
            .define_variable("L0101-L0102", &[2, CHUNK_SIZE])
            .unwrap();
        writer.open().unwrap();
        for step in 0..5u64 {
            let frame: Vec<f64> = (0..2 * CHUNK_SIZE)
                .map(|i| 2.0 + ((i as f64 + step as f64) * 0.37).sin())
                .collect();
            writer.begin_step().unwrap();
            writer.put("L0101-L0102", &frame).unwrap();
            writer.end_step().unwrap();
        }
        writer.close().unwrap();
    });

    let stream_range: ChannelRange = settings.transport.channel_range[0].parse().unwrap();
    let tasks: Vec<AnalysisTask> = settings
        .task_list
        .iter()
        .map(|t| AnalysisTask::from_settings(t).unwrap())
        .collect();
    let params = FftParams::from_settings(&settings.fft_params, settings.f_sample()).unwrap();
    let pipeline = Pipeline::new(
        ChunkFactory::new(&settings.diagnostic, stream_range.len()),
        Normalizer::new(
            settings.diagnostic.parameters.t_norm[0],
            settings.diagnostic.parameters.t_norm[1],
        ),
        Stft::new(params),
        tasks,
        Dispatcher::new(stream_range),
        Executor::new(settings.processor.n_workers),
        backend.clone(),
        &settings.processor,
        "TEST03".into(),
    );

    let stats = pipeline
        .run(Box::new(reader), "L0101-L0102".into())
        .await
        .unwrap();
    producer.join().unwrap();

    // The receiver outpaces the throttled consumer by far; with two queue
    // slots it must have hit a full queue at least three times over five
    // chunks.
    assert!(
        stats.producer_blocked >= 3,
        "receiver only blocked {} times",
        stats.producer_blocked
    );
    assert_eq!(stats.received, 5);
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.stored, 5);

    // Every tidx 0..5 stored exactly once.
    let catalog = std::fs::read_to_string(backend.dir().join("catalog.jsonl")).unwrap();
    let mut tidxs: Vec<u64> = catalog
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["tidx"]
                .as_u64()
                .unwrap()
        })
        .collect();
    tidxs.sort_unstable();
    assert_eq!(tidxs, [0, 1, 2, 3, 4]);
}
