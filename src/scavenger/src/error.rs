use thiserror::Error;

/// Errors raised while scavenging
#[derive(Debug, Error)]
pub enum ScavengeError {
    /// The run was asked to stop. Committed progress remains valid.
    #[error("Scavenge was cancelled")]
    Cancelled,

    /// The log holds records the scavenger cannot safely interpret
    #[error("{0}")]
    Integrity(String),

    /// A pre-flight requirement is not met
    #[error("{0}")]
    Precondition(String),

    /// The archive never confirmed a chunk within the configured attempts
    #[error("Chunk {chunk} has not been archived after {attempts} attempts")]
    NotArchived { chunk: String, attempts: u32 },

    /// Begin/commit/rollback called out of order
    #[error("Transaction misuse: {0}")]
    TransactionMisuse(&'static str),

    /// State backend or collaborator failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScavengeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScavengeError::Cancelled)
    }

    /// Whether the error means the log itself must be repaired before scavenging again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScavengeError::Integrity(_) | ScavengeError::Precondition(_)
        )
    }
}

impl From<serde_json::Error> for ScavengeError {
    fn from(err: serde_json::Error) -> Self {
        ScavengeError::Other(err.into())
    }
}

pub type Result<T, E = ScavengeError> = std::result::Result<T, E>;
