//! Process-wide run context.
//!
//! All process-wide state lives in a single [`RunContext`] value constructed
//! at startup and passed explicitly to the components that need it. There are
//! no hidden globals; the context is immutable after construction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::Settings;

const RUN_ID_LEN: usize = 6;
const RUN_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Immutable per-run state: the run identifier, the frozen configuration
/// snapshot and the start timestamp recorded in metadata documents.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub cfg: Arc<Settings>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(cfg: Settings) -> Self {
        Self {
            run_id: gen_run_id(),
            cfg: Arc::new(cfg),
            started_at: Utc::now(),
        }
    }
}

/// Random 6-character token from uppercase ASCII and digits, used to key
/// storage collections and on-disk result directories.
fn gen_run_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RUN_ID_LEN)
        .map(|_| RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())] as char)
        .collect()
}
