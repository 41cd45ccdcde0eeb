//! Generator driver: replays an archived shot over the transport.
//!
//! Reads the configured channel block chunk-wise from the archive, defines
//! one framed variable named after the channel range plus a `cfg` attribute
//! carrying the frozen run configuration, then publishes one chunk per step
//! and closes the stream.

use std::time::Duration;

use log::info;

use crate::context::RunContext;
use crate::data::channel::ChannelRange;
use crate::error::{DeltaError, Result};
use crate::source::EceiLoader;
use crate::transport;

pub fn run(ctx: &RunContext) -> Result<()> {
    let cfg = &ctx.cfg;
    let range: ChannelRange = cfg.diagnostic.datasource.channel_range[0].parse()?;
    let var_name = range.to_string();
    let stream = transport::stream_name(&cfg.diagnostic);

    info!(
        "run_id={} generator: shot {} range {} over {:?} as '{stream}'",
        ctx.run_id, cfg.diagnostic.shotnr, var_name, cfg.transport.engine
    );

    let loader = EceiLoader::new(&cfg.diagnostic.datasource, &range)?;
    let mut writer = transport::open_writer(&cfg.transport, &stream)?;
    writer.define_variable(&var_name, &[range.len(), cfg.diagnostic.datasource.chunk_size])?;
    let cfg_json = serde_json::to_string(&**cfg)
        .map_err(|e| DeltaError::Configuration(format!("cannot serialize config: {e}")))?;
    writer.define_attribute("cfg", &cfg_json)?;
    writer.open()?;

    let step_delay = Duration::from_millis(cfg.transport.params.step_delay_ms);
    for idx in 0..loader.num_chunks() {
        let chunk = loader.chunk(idx)?;
        let frame: Vec<f64> = chunk.iter().copied().collect();
        writer.begin_step()?;
        writer.put(&var_name, &frame)?;
        writer.end_step()?;
        info!(
            "run_id={} generator: published step {idx}/{}",
            ctx.run_id,
            loader.num_chunks()
        );
        if !step_delay.is_zero() {
            std::thread::sleep(step_delay);
        }
    }
    writer.close()?;
    info!("run_id={} generator: stream closed", ctx.run_id);
    Ok(())
}
