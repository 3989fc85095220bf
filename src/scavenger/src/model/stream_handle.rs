use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stream is addressed in the scavenge state.
///
/// Streams are addressed by hash unless their hash is known to collide with
/// another stream, in which case they are addressed by their full id.
/// Ordered by kind, then value.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum StreamHandle {
    #[default]
    None,
    Hash(u64),
    Id(String),
}

impl StreamHandle {
    pub fn is_none(&self) -> bool {
        matches!(self, StreamHandle::None)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::None => write!(f, "None"),
            StreamHandle::Hash(hash) => write!(f, "Hash: {hash}"),
            StreamHandle::Id(id) => write!(f, "Id: {id}"),
        }
    }
}
