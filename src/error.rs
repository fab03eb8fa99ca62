use thiserror::Error;

/// Why a request could not be carried by the connection.
///
/// Every variant is global to the connection rather than to one request:
/// a `Lost` is delivered to *all* callers that were in flight when the
/// link dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection did not reach the open state in time (or no endpoint
    /// has been configured yet).
    #[error("connection not ready")]
    NotReady,

    /// The connection dropped while the request was outstanding.
    #[error("connection lost")]
    Lost,

    /// The client has been shut down.
    #[error("client shut down")]
    Closed,

    /// The transport failed to open a link.
    #[error("failed to open connection: {0}")]
    Open(String),
}

/// Errors that can occur while talking to the key-value server.
#[derive(Error, Debug)]
pub enum KvError {
    /// Connection never became ready, or was lost mid-request.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A frame with an unrecognized shape.
    ///
    /// The connection driver logs and counts these; they are only returned
    /// directly from the codec functions.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered `ok: false` to this caller's request.
    #[error("remote error on {command}: {message}")]
    Remote { command: String, message: String },

    /// No response within the configured request timeout.
    #[error("request timed out")]
    Timeout,

    /// JSON encoding of an outbound frame or value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded into the requested type.
    #[error("failed to decode value of {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A response carried data of the wrong shape for its command.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Required configuration was not provided.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// The endpoint address could not be interpreted by the transport.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl KvError {
    /// True for failures caused by the connection rather than the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, KvError::Connection(_))
    }

    /// True when the server rejected the request.
    pub fn is_remote(&self) -> bool {
        matches!(self, KvError::Remote { .. })
    }

    /// A copy of this error for fanning one failure out to several callers.
    ///
    /// JSON errors cannot be cloned and keep only their message.
    pub(crate) fn duplicate(&self) -> KvError {
        // ---
        match self {
            KvError::Connection(err) => KvError::Connection(err.clone()),
            KvError::Protocol(message) => KvError::Protocol(message.clone()),
            KvError::Remote { command, message } => KvError::Remote {
                command: command.clone(),
                message: message.clone(),
            },
            KvError::Timeout => KvError::Timeout,
            KvError::Serialization(err) => KvError::Protocol(err.to_string()),
            KvError::Decode { key, source } => {
                KvError::InvalidResponse(format!("failed to decode value of {key}: {source}"))
            }
            KvError::InvalidResponse(message) => KvError::InvalidResponse(message.clone()),
            KvError::MissingConfig(message) => KvError::MissingConfig(message.clone()),
            KvError::InvalidAddress(message) => KvError::InvalidAddress(message.clone()),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, KvError>;
