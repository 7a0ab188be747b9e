//! TPoT wire protocol
//!
//! This crate defines the binary frames exchanged with a TPoT relay over the
//! single persistent WebSocket connection. Every WebSocket binary message
//! carries exactly one frame:
//!
//! ```text
//! control:      [MSG_CONTROL][sub-type][payload...]
//! conversation: [MSG_CONVO][id lo][id hi][code][payload...]
//! ```
//!
//! All multi-byte integers are little-endian. The codec is pure: no I/O and no
//! state beyond the bytes it is handed.

pub mod codes;
pub mod frame;
pub mod messages;

pub use frame::{
    CodecError, ControlMessage, ConversationFrame, ConversationId, ConversationMessage, Frame,
};
pub use messages::{ConversationType, Greeting, NewConversation, GREETING_TAG};

/// Path of the WebSocket upgrade endpoint on the relay
pub const CONNECT_PATH: &str = "/create-tpot";
