use relaynode_core::envelope::DestinationKey;

/// Per-call failures of the session registry and packet forwarder.
///
/// None of these affect other sessions; the caller decides whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session id '{0}' is reserved or empty")]
    InvalidSessionId(String),

    #[error("node is not accepting new sessions")]
    AdmissionClosed,

    #[error("session capacity exhausted ({limit} sessions)")]
    CapacityExhausted { limit: usize },

    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("invalid packet envelope: {0}")]
    InvalidEnvelope(String),

    #[error("upstream {dest} unreachable: {reason}")]
    UpstreamUnreachable { dest: DestinationKey, reason: String },

    #[error("write to upstream {dest} failed: {reason}")]
    UpstreamWrite { dest: DestinationKey, reason: String },
}

impl TunnelError {
    /// True for failures caused by the request itself rather than by I/O.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TunnelError::SessionNotFound(_)
                | TunnelError::InvalidSessionId(_)
                | TunnelError::PacketTooLarge { .. }
                | TunnelError::InvalidEnvelope(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
