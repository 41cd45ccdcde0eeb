//! Streaming time-base.
//!
//! Chunks arrive as fixed-length windows of a continuous acquisition.
//! A [`TimeBase`] maps between a chunk-local sample index and physical time,
//! assuming samples stream in contiguously at `f_sample` starting at
//! `t_start`. Consecutive chunk indices therefore cover non-overlapping,
//! contiguous time intervals.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBase {
    /// Trigger time of the first sample of the acquisition, in seconds.
    pub t_start: f64,
    /// End of the acquisition window, in seconds.
    pub t_end: f64,
    /// Sampling rate in Hz.
    pub f_sample: f64,
    pub samples_per_chunk: usize,
    /// Index of the chunk this time-base describes.
    pub chunk_idx: u64,
}

impl TimeBase {
    pub fn new(
        t_start: f64,
        t_end: f64,
        f_sample: f64,
        samples_per_chunk: usize,
        chunk_idx: u64,
    ) -> Self {
        Self {
            t_start,
            t_end,
            f_sample,
            samples_per_chunk,
            chunk_idx,
        }
    }

    /// Physical time of sample `i` of this chunk.
    pub fn sample_to_time(&self, i: usize) -> f64 {
        let global = self.chunk_idx as f64 * self.samples_per_chunk as f64 + i as f64;
        self.t_start + global / self.f_sample
    }

    /// Chunk-local sample index of time `t`, or `None` when `t` falls
    /// outside this chunk's window.
    pub fn time_to_index(&self, t: f64) -> Option<usize> {
        let global = ((t - self.t_start) * self.f_sample).round() as i64;
        let local = global - self.chunk_idx as i64 * self.samples_per_chunk as i64;
        if (0..self.samples_per_chunk as i64).contains(&local) {
            Some(local as usize)
        } else {
            None
        }
    }

    /// The time-base of chunk `chunk_idx` of the same acquisition.
    pub fn for_chunk(&self, chunk_idx: u64) -> Self {
        Self { chunk_idx, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb(chunk_idx: u64) -> TimeBase {
        TimeBase::new(-0.1, 61.1, 5e5, 10_000, chunk_idx)
    }

    #[test]
    fn index_time_roundtrip() {
        for chunk_idx in [0, 1, 7] {
            let tb = tb(chunk_idx);
            for i in [0usize, 1, 17, 4999, 9999] {
                assert_eq!(tb.time_to_index(tb.sample_to_time(i)), Some(i));
            }
        }
    }

    #[test]
    fn chunks_tile_the_time_axis() {
        let a = tb(3);
        let b = tb(4);
        let last_of_a = a.sample_to_time(a.samples_per_chunk - 1);
        let first_of_b = b.sample_to_time(0);
        assert!(first_of_b > last_of_a);
        assert!((first_of_b - last_of_a - 1.0 / a.f_sample).abs() < 1e-12);
    }

    #[test]
    fn out_of_window_times_map_to_none() {
        let tb = tb(1);
        // Last sample of chunk 0 and first of chunk 2.
        assert_eq!(tb.time_to_index(tb.t_start + 9_999.0 / tb.f_sample), None);
        assert_eq!(tb.time_to_index(tb.t_start + 20_000.0 / tb.f_sample), None);
        // Boundary samples of chunk 1 itself.
        assert_eq!(tb.time_to_index(tb.t_start + 10_000.0 / tb.f_sample), Some(0));
        assert_eq!(
            tb.time_to_index(tb.t_start + 19_999.0 / tb.f_sample),
            Some(9_999)
        );
    }
}
