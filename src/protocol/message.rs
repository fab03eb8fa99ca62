use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CorrelationId, KvError, Result};

/// Whether a subscription matches one key exactly or every key sharing a
/// string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    Exact,
    Prefix,
}

/// Outbound command.
///
/// Serializes as `{"command": "<name>", "data": {...}}`; the correlation
/// token is added when the command is framed (see
/// [`encode_request`](crate::protocol::encode_request)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum Command {
    #[serde(rename = "kget")]
    Get { key: String },

    #[serde(rename = "kget_many")]
    GetMany { keys: Vec<String> },

    #[serde(rename = "kget_prefix")]
    GetPrefix { prefix: String },

    #[serde(rename = "kset")]
    Set { key: String, value: String },

    #[serde(rename = "kset_many")]
    SetMany { entries: BTreeMap<String, String> },

    #[serde(rename = "ksub")]
    Subscribe { key: String },

    #[serde(rename = "kunsub")]
    Unsubscribe { key: String },

    #[serde(rename = "ksub_prefix")]
    SubscribePrefix { prefix: String },

    #[serde(rename = "kunsub_prefix")]
    UnsubscribePrefix { prefix: String },

    #[serde(rename = "klist")]
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },

    #[serde(rename = "kdelete")]
    Delete { key: String },

    #[serde(rename = "kversion")]
    Version {},
}

impl Command {
    /// Wire name of the command, echoed by the server as `cmd`.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "kget",
            Command::GetMany { .. } => "kget_many",
            Command::GetPrefix { .. } => "kget_prefix",
            Command::Set { .. } => "kset",
            Command::SetMany { .. } => "kset_many",
            Command::Subscribe { .. } => "ksub",
            Command::Unsubscribe { .. } => "kunsub",
            Command::SubscribePrefix { .. } => "ksub_prefix",
            Command::UnsubscribePrefix { .. } => "kunsub_prefix",
            Command::List { .. } => "klist",
            Command::Delete { .. } => "kdelete",
            Command::Version {} => "kversion",
        }
    }

    /// Server-side subscribe command for a key or prefix.
    pub fn subscribe(kind: SubscriptionKind, key: impl Into<String>) -> Self {
        match kind {
            SubscriptionKind::Exact => Command::Subscribe { key: key.into() },
            SubscriptionKind::Prefix => Command::SubscribePrefix { prefix: key.into() },
        }
    }

    /// Server-side unsubscribe command for a key or prefix.
    pub fn unsubscribe(kind: SubscriptionKind, key: impl Into<String>) -> Self {
        match kind {
            SubscriptionKind::Exact => Command::Unsubscribe { key: key.into() },
            SubscriptionKind::Prefix => Command::UnsubscribePrefix { prefix: key.into() },
        }
    }
}

/// A key's stored value changed.
///
/// `value` is `None` when the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    pub key: String,
    pub value: Option<String>,
}

/// Successful, correlated reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: CorrelationId,

    /// Command name echoed by the server. May be empty if the server omits it.
    pub cmd: String,

    /// Response payload. Always text on the wire; multi-value responses
    /// carry a JSON document inside the string.
    pub data: Option<String>,
}

impl Response {
    /// Interpret the response as the server's acknowledgement flag.
    ///
    /// Absent data on an `ok: true` response counts as acknowledged.
    pub fn flag(&self) -> Result<bool> {
        match self.data.as_deref().map(str::trim) {
            None | Some("") | Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(KvError::InvalidResponse(format!(
                "{}: expected a boolean flag, got {other:?}",
                self.cmd
            ))),
        }
    }

    /// Decode the JSON document carried in `data`.
    ///
    /// Returns `Ok(None)` when the response has no data.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let Some(data) = self.data.as_deref() else {
            return Ok(None);
        };

        serde_json::from_str(data)
            .map(Some)
            .map_err(|err| KvError::InvalidResponse(format!("{}: {err}", self.cmd)))
    }

    /// Decode a key → value mapping, treating missing data as empty.
    pub fn entries(&self) -> Result<HashMap<String, String>> {
        Ok(self.json()?.unwrap_or_default())
    }
}

/// Inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Response(Response),
    Error {
        request_id: Option<CorrelationId>,
        message: String,
    },
    Push(KeyUpdate),
}

/// Loose view of any inbound frame; classification happens in
/// [`Inbound::parse`].
#[derive(Deserialize)]
struct RawInbound {
    ok: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
    cmd: Option<String>,
    request_id: Option<Value>,
    data: Option<Value>,
    error: Option<String>,
    key: Option<String>,
    new_value: Option<Value>,
}

impl Inbound {
    /// Parse one frame (without its trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Protocol`] for anything that is not a response,
    /// error, or push frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let raw: RawInbound = serde_json::from_slice(frame)
            .map_err(|err| KvError::Protocol(format!("malformed frame: {err}")))?;

        let request_id = raw.request_id.and_then(token_from_value);

        if raw.kind.as_deref() == Some("push") {
            let key = raw
                .key
                .ok_or_else(|| KvError::Protocol("push frame without key".into()))?;

            return Ok(Inbound::Push(KeyUpdate {
                key,
                value: raw.new_value.and_then(text_from_value),
            }));
        }

        match raw.ok {
            Some(false) => Ok(Inbound::Error {
                request_id,
                message: raw
                    .error
                    .unwrap_or_else(|| "unspecified server error".to_string()),
            }),
            Some(true) => {
                if let Some(kind) = raw.kind.as_deref() {
                    if kind != "response" {
                        return Err(KvError::Protocol(format!("unexpected frame type {kind:?}")));
                    }
                }

                let request_id = request_id
                    .ok_or_else(|| KvError::Protocol("response without request_id".into()))?;

                Ok(Inbound::Response(Response {
                    request_id,
                    cmd: raw.cmd.unwrap_or_default(),
                    data: raw.data.and_then(text_from_value),
                }))
            }
            None => Err(KvError::Protocol(
                "frame is neither a reply nor a push".into(),
            )),
        }
    }

    /// Encode the frame as JSON (no trailing newline).
    ///
    /// Clients never send these; servers and test harnesses do.
    pub fn encode(&self) -> Result<Bytes> {
        let mut map = Map::new();

        match self {
            Inbound::Response(resp) => {
                map.insert("ok".into(), Value::Bool(true));
                map.insert("type".into(), Value::from("response"));
                map.insert("cmd".into(), Value::from(resp.cmd.as_str()));
                map.insert("request_id".into(), Value::from(resp.request_id.as_str()));
                if let Some(data) = &resp.data {
                    map.insert("data".into(), Value::from(data.as_str()));
                }
            }
            Inbound::Error {
                request_id,
                message,
            } => {
                map.insert("ok".into(), Value::Bool(false));
                map.insert("error".into(), Value::from(message.as_str()));
                if let Some(id) = request_id {
                    map.insert("request_id".into(), Value::from(id.as_str()));
                }
            }
            Inbound::Push(update) => {
                map.insert("type".into(), Value::from("push"));
                map.insert("key".into(), Value::from(update.key.as_str()));
                map.insert(
                    "new_value".into(),
                    update.value.as_deref().map_or(Value::Null, Value::from),
                );
            }
        }

        Ok(Bytes::from(serde_json::to_vec(&Value::Object(map))?))
    }
}

fn token_from_value(value: Value) -> Option<CorrelationId> {
    match value {
        Value::String(s) => Some(CorrelationId::from(s)),
        Value::Number(n) => Some(CorrelationId::from(n.to_string())),
        _ => None,
    }
}

fn text_from_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
