//! Stream naming rules and stream id hashing.

use xxhash_rust::xxh3::xxh3_64;

/// Stream holding scavenge point records
pub const SCAVENGE_POINTS_STREAM: &str = "$scavenges";

/// Event type of a scavenge point record
pub const SCAVENGE_POINT_EVENT_TYPE: &str = "$scavengePoint";

/// Event type of a metadata record
pub const METADATA_EVENT_TYPE: &str = "$metadata";

const METASTREAM_PREFIX: &str = "$$";

pub fn is_metastream(stream_id: &str) -> bool {
    stream_id.starts_with(METASTREAM_PREFIX)
}

pub fn metastream_of(stream_id: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream_id}")
}

/// The stream a metastream describes. Returns the input for plain streams.
pub fn original_stream_of(metastream_id: &str) -> &str {
    metastream_id
        .strip_prefix(METASTREAM_PREFIX)
        .unwrap_or(metastream_id)
}

/// Maps a stream id to the hash it is indexed under.
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream_id: &str) -> u64;
}

/// Production hasher, xxh3 over the UTF-8 bytes of the id
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3StreamHasher;

impl StreamHasher for Xxh3StreamHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        xxh3_64(stream_id.as_bytes())
    }
}
