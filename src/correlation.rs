use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation token attached to every outbound request and echoed by the
/// server in the matching response or error frame.
///
/// Tokens are generated, never derived from the request payload, so two
/// byte-identical requests in flight at the same time still resolve
/// independently.
///
/// # Format
///
/// UUID v4 in the standard 36-byte string form on the wire
/// (`"request_id": "550e8400-e29b-41d4-a9b6-446655440000"`). Inbound tokens
/// are accepted verbatim, whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
