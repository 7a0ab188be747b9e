//! Frame envelope encoding and decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codes;
use crate::messages::{ConversationType, Greeting, NewConversation};

/// Conversation identifier, assigned by the relay
pub type ConversationId = u16;

/// Codec errors. Any of these means the peer is out of sync with us.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Unknown control message: {0:#04x}")]
    UnknownControlType(u8),

    #[error("Unknown conversation control code: {0:#04x}")]
    UnknownConversationCode(u8),

    #[error("Truncated {what}: expected at least {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected greeting: {0:?}")]
    BadGreeting(String),
}

/// Payload of a control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Greeting(Greeting),
    NewConversation(NewConversation),
}

/// Per-conversation signal or data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationMessage {
    Data(Bytes),
    Pause,
    Resume,
    Closed,
    NoConnect,
}

impl ConversationMessage {
    pub fn code(&self) -> u8 {
        match self {
            ConversationMessage::Data(_) => codes::CONVO_DATA,
            ConversationMessage::Pause => codes::CONVO_PAUSE,
            ConversationMessage::Resume => codes::CONVO_RESUME,
            ConversationMessage::Closed => codes::CONVO_CLOSED,
            ConversationMessage::NoConnect => codes::CONVO_NOCONNECT,
        }
    }

    fn decode(code: u8, payload: Bytes) -> Result<Self, CodecError> {
        match code {
            codes::CONVO_DATA => Ok(ConversationMessage::Data(payload)),
            codes::CONVO_PAUSE => Ok(ConversationMessage::Pause),
            codes::CONVO_RESUME => Ok(ConversationMessage::Resume),
            codes::CONVO_CLOSED => Ok(ConversationMessage::Closed),
            codes::CONVO_NOCONNECT => Ok(ConversationMessage::NoConnect),
            other => Err(CodecError::UnknownConversationCode(other)),
        }
    }
}

/// Conversation-addressed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationFrame {
    pub id: ConversationId,
    pub message: ConversationMessage,
}

impl ConversationFrame {
    /// envelope (1) + id (2) + code (1)
    pub const HEADER_SIZE: usize = 4;

    pub fn new(id: ConversationId, message: ConversationMessage) -> Self {
        Self { id, message }
    }

    pub fn data(id: ConversationId, payload: Bytes) -> Self {
        Self::new(id, ConversationMessage::Data(payload))
    }

    /// Encode straight from a borrowed slice, avoiding an intermediate `Bytes`
    pub fn encode_data(id: ConversationId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload.len());
        buf.put_u8(codes::MSG_CONVO);
        buf.put_u16_le(id);
        buf.put_u8(codes::CONVO_DATA);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = match &self.message {
            ConversationMessage::Data(payload) => payload.len(),
            _ => 0,
        };

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u8(codes::MSG_CONVO);
        buf.put_u16_le(self.id);
        buf.put_u8(self.message.code());
        if let ConversationMessage::Data(payload) = &self.message {
            buf.put_slice(payload);
        }
        buf.freeze()
    }
}

/// One decoded WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Conversation(ConversationFrame),
}

impl Frame {
    pub fn greeting(subdomain: impl Into<String>) -> Self {
        Frame::Control(ControlMessage::Greeting(Greeting::new(subdomain)))
    }

    pub fn new_conversation(convo: NewConversation) -> Self {
        Frame::Control(ControlMessage::NewConversation(convo))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Conversation(frame) => frame.encode(),
            Frame::Control(control) => {
                let mut buf = BytesMut::with_capacity(64);
                buf.put_u8(codes::MSG_CONTROL);
                match control {
                    ControlMessage::Greeting(greeting) => {
                        buf.put_u8(codes::CONTROL_GREETINGS);
                        greeting.encode_into(&mut buf);
                    }
                    ControlMessage::NewConversation(convo) => {
                        buf.put_u8(convo.kind.code());
                        convo.encode_into(&mut buf);
                    }
                }
                buf.freeze()
            }
        }
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Empty);
        }

        match buf.get_u8() {
            codes::MSG_CONTROL => Self::decode_control(buf),
            codes::MSG_CONVO => Self::decode_conversation(buf),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }

    fn decode_control(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated {
                what: "control frame",
                expected: 1,
                actual: 0,
            });
        }

        let control = match buf.get_u8() {
            codes::CONTROL_GREETINGS => ControlMessage::Greeting(Greeting::decode(&buf)?),
            code => {
                let kind = ConversationType::try_from(code)?;
                ControlMessage::NewConversation(NewConversation::decode(kind, buf)?)
            }
        };

        Ok(Frame::Control(control))
    }

    fn decode_conversation(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.len() < ConversationFrame::HEADER_SIZE - 1 {
            return Err(CodecError::Truncated {
                what: "conversation frame",
                expected: ConversationFrame::HEADER_SIZE - 1,
                actual: buf.len(),
            });
        }

        let id = buf.get_u16_le();
        let code = buf.get_u8();
        let message = ConversationMessage::decode(code, buf)?;

        Ok(Frame::Conversation(ConversationFrame { id, message }))
    }
}
