//! Data model for the streamed diagnostic.
//!
//! The vocabulary the pipeline speaks: channel identities and ranges
//! ([`channel`]), the streaming time-base that maps sample indices to
//! physical time ([`timebase`]), the time-domain and frequency-domain chunk
//! carriers ([`chunk`]) and the warm-up normalizer ([`normalizer`]).

pub mod channel;
pub mod chunk;
pub mod normalizer;
pub mod timebase;

pub use channel::{Channel, ChannelRange};
pub use chunk::{Chunk, ChunkFactory, FftChunk};
pub use normalizer::Normalizer;
pub use timebase::TimeBase;
