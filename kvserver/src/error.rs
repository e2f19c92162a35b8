//! Error types for the key-value service.

use thiserror::Error;

/// Errors surfaced on the startup path and by the snapshot codec.
///
/// Request-level failures never use this type; they travel as `ErrCode`
/// values in RPC replies. Anything here that reaches the apply pump is
/// fatal to the process.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{stage}: {source}")]
    Runtime {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("encode snapshot: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decode snapshot: {0}")]
    Decode(#[source] bincode::Error),
}

impl KvError {
    /// Wraps an arbitrary error with the startup stage it occurred in.
    pub fn runtime<E>(stage: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KvError::Runtime {
            stage,
            source: Box::new(source),
        }
    }
}
