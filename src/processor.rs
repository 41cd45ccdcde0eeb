//! Processor driver: receives the stream and runs the analysis pipeline.
//!
//! Startup order matters: configuration-derived objects (tasks, transform,
//! dispatcher) are built and validated first, then the storage backend is
//! constructed and the run-config and metadata documents are written — a
//! failure there is fatal — and only then does the transport open and the
//! pipeline start. A Ctrl-C stops the receiver after the chunk in flight
//! and drains the pipeline.

use std::sync::atomic::Ordering;

use log::{error, info};

use crate::analysis::stft::{FftParams, Stft};
use crate::analysis::task::{serialize_dispatch_seq, AnalysisTask};
use crate::context::RunContext;
use crate::data::channel::ChannelRange;
use crate::data::chunk::ChunkFactory;
use crate::data::normalizer::Normalizer;
use crate::error::Result;
use crate::pipeline::{Dispatcher, Executor, Pipeline, PipelineStats};
use crate::storage;
use crate::transport;

pub async fn run(ctx: &RunContext) -> Result<PipelineStats> {
    let cfg = &ctx.cfg;
    let started = std::time::Instant::now();
    info!("run_id={} processor starting", ctx.run_id);

    let stream_range: ChannelRange = cfg.transport.channel_range[0].parse()?;
    let tasks: Vec<AnalysisTask> = cfg
        .task_list
        .iter()
        .map(AnalysisTask::from_settings)
        .collect::<Result<_>>()?;
    let dispatcher = Dispatcher::new(stream_range);
    for task in &tasks {
        dispatcher.validate(task)?;
    }

    let fft_params = FftParams::from_settings(&cfg.fft_params, cfg.f_sample())?;
    let stft = Stft::new(fft_params);
    let normalizer = Normalizer::new(
        cfg.diagnostic.parameters.t_norm[0],
        cfg.diagnostic.parameters.t_norm[1],
    );
    let factory = ChunkFactory::new(&cfg.diagnostic, stream_range.len());

    // Metadata failures at this point are fatal; without the dispatch
    // sequence on record the result rows cannot be attributed later.
    let backend = storage::create_backend(cfg, &ctx.run_id).await?;
    backend
        .store_one(serde_json::json!({
            "run_id": ctx.run_id,
            "run_config": &**cfg,
            "description": "run configuration",
        }))
        .await?;
    let dispatch_seq = serialize_dispatch_seq(&tasks);
    let doc_id = backend
        .store_metadata(cfg, &ctx.run_id, &dispatch_seq)
        .await?;
    info!("run_id={} stored metadata as {doc_id}", ctx.run_id);

    let executor = Executor::new(cfg.processor.n_workers);
    let pipeline = Pipeline::new(
        factory,
        normalizer,
        stft,
        tasks,
        dispatcher,
        executor,
        backend.clone(),
        &cfg.processor,
        ctx.run_id.clone(),
    );

    let stop = pipeline.stop_handle();
    let run_id = ctx.run_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("run_id={run_id} interrupt received, stopping after the current chunk");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let stream = transport::stream_name(&cfg.diagnostic);
    let reader = transport::open_reader(&cfg.transport, &stream)?;
    info!("run_id={} waiting for stream '{stream}'", ctx.run_id);

    let stats = pipeline.run(reader, stream_range.to_string()).await?;
    backend.shutdown().await?;

    info!(
        "run_id={} finished in {:.3}s",
        ctx.run_id,
        started.elapsed().as_secs_f64()
    );
    Ok(stats)
}
