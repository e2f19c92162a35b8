use serde::{Deserialize, Serialize};

/// A client command as replicated through the consensus log.
///
/// This is the sole payload submitted to consensus; the apply pump decodes
/// it and drives the state machine. `Get` carries no mutation but is still
/// replicated so the reply reflects a state ordered after all earlier
/// committed writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Establish a session; `nonce` makes the resulting id unguessable.
    OpenSession { nonce: String },
    /// Linearization point for a read.
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
    Delete { key: String },
}

impl Command {
    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::OpenSession { .. } => "OpenSession",
            Command::Get { .. } => "Get",
            Command::Put { .. } => "Put",
            Command::Append { .. } => "Append",
            Command::Delete { .. } => "Delete",
        }
    }
}
