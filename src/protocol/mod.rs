//! Wire protocol for the key-value server.
//!
//! Frames are newline-delimited JSON objects. Outbound frames are commands
//! carrying a correlation token; inbound frames are responses, errors, or
//! uncorrelated push notifications. This module owns the frame shapes and the
//! reassembly of frames from raw deliveries; it knows nothing about
//! connections or pending requests.

mod codec;
mod message;

pub use codec::{encode_request, FrameBuffer, DEFAULT_MAX_FRAME_LEN};
pub use message::{Command, Inbound, KeyUpdate, Response, SubscriptionKind};
