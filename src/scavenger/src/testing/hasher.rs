use crate::model::StreamHasher;
use crate::model::streams::{is_metastream, original_stream_of};

/// Hashes a stream by the first character of its name, so tests can pick
/// colliding stream ids by eye. Metastreams hash 1000 apart from plain
/// streams, keeping `ab-1` and `$$ab-1` on different hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HumanReadableHasher;

impl StreamHasher for HumanReadableHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        let offset = if is_metastream(stream_id) { 1000 } else { 0 };
        original_stream_of(stream_id)
            .bytes()
            .next()
            .map(u64::from)
            .unwrap_or(0)
            + offset
    }
}
