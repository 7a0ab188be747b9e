//! Single-byte codes used on the wire.
//!
//! The values are printable ASCII so a hex dump of a frame stays readable.

/// Outer envelope: control frame
pub const MSG_CONTROL: u8 = b'C';
/// Outer envelope: conversation-addressed frame
pub const MSG_CONVO: u8 = b'V';

/// Control sub-type: server greeting
pub const CONTROL_GREETINGS: u8 = b'G';
/// Control sub-type: new HTTP conversation
pub const TYPE_HTTP: u8 = b'H';

/// Conversation code: raw payload follows
pub const CONVO_DATA: u8 = b'D';
/// Conversation code: stop sending until resumed
pub const CONVO_PAUSE: u8 = b'P';
/// Conversation code: sending may continue
pub const CONVO_RESUME: u8 = b'R';
/// Conversation code: sender has closed its side
pub const CONVO_CLOSED: u8 = b'X';
/// Conversation code: the upstream could not be reached
pub const CONVO_NOCONNECT: u8 = b'N';
