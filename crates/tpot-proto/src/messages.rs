//! Control message payloads

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::codes;
use crate::frame::{CodecError, ConversationId};

/// Tag every greeting payload starts with. Matched ASCII case-insensitively.
pub const GREETING_TAG: &str = "TPoT/1 ";

/// Kind of conversation requested by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationType {
    Http,
}

impl ConversationType {
    pub fn code(self) -> u8 {
        match self {
            ConversationType::Http => codes::TYPE_HTTP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Http => "http",
        }
    }
}

impl TryFrom<u8> for ConversationType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            codes::TYPE_HTTP => Ok(ConversationType::Http),
            _ => Err(CodecError::UnknownControlType(value)),
        }
    }
}

/// First control message sent by the relay once the upgrade completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Subdomain the relay assigned to this tunnel
    pub subdomain: String,
}

impl Greeting {
    pub fn new(subdomain: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
        }
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let tag = GREETING_TAG.as_bytes();
        if payload.len() < tag.len() || !payload[..tag.len()].eq_ignore_ascii_case(tag) {
            return Err(CodecError::BadGreeting(
                String::from_utf8_lossy(payload).into_owned(),
            ));
        }

        let subdomain = std::str::from_utf8(&payload[tag.len()..])
            .map_err(|_| CodecError::BadGreeting(String::from_utf8_lossy(payload).into_owned()))?;

        let valid = !subdomain.is_empty()
            && subdomain
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !valid {
            return Err(CodecError::BadGreeting(subdomain.to_string()));
        }

        Ok(Self {
            subdomain: subdomain.to_string(),
        })
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(GREETING_TAG.as_bytes());
        buf.put_slice(self.subdomain.as_bytes());
    }
}

/// Request from the relay to open a new conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub id: ConversationId,
    pub kind: ConversationType,
    /// Address of the remote client that opened the connection at the relay
    pub source: SocketAddrV4,
    /// First upstream-bound bytes, possibly empty
    pub initial_data: Bytes,
}

impl NewConversation {
    /// id (2) + IPv4 address (4) + port (2)
    pub const HEADER_SIZE: usize = 8;

    pub(crate) fn decode(kind: ConversationType, mut payload: Bytes) -> Result<Self, CodecError> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(CodecError::Truncated {
                what: "new conversation",
                expected: Self::HEADER_SIZE,
                actual: payload.len(),
            });
        }

        let id = payload.get_u16_le();
        let ip = Ipv4Addr::new(
            payload.get_u8(),
            payload.get_u8(),
            payload.get_u8(),
            payload.get_u8(),
        );
        let port = payload.get_u16_le();

        Ok(Self {
            id,
            kind,
            source: SocketAddrV4::new(ip, port),
            initial_data: payload,
        })
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.id);
        buf.put_slice(&self.source.ip().octets());
        buf.put_u16_le(self.source.port());
        buf.put_slice(&self.initial_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_accepts_either_tag_case() {
        let greeting = Greeting::decode(b"TPoT/1 happy-fox").unwrap();
        assert_eq!(greeting.subdomain, "happy-fox");

        let greeting = Greeting::decode(b"TPOT/1 abc123").unwrap();
        assert_eq!(greeting.subdomain, "abc123");
    }

    #[test]
    fn test_greeting_rejects_wrong_tag() {
        assert!(matches!(
            Greeting::decode(b"HELLO/1 abc"),
            Err(CodecError::BadGreeting(_))
        ));
        assert!(matches!(
            Greeting::decode(b"TPoT/2 abc"),
            Err(CodecError::BadGreeting(_))
        ));
        assert!(matches!(
            Greeting::decode(b"TPoT"),
            Err(CodecError::BadGreeting(_))
        ));
    }

    #[test]
    fn test_greeting_rejects_bad_subdomain() {
        assert!(Greeting::decode(b"TPoT/1 ").is_err());
        assert!(Greeting::decode(b"TPoT/1 a.b").is_err());
        assert!(Greeting::decode(b"TPoT/1 a b").is_err());
    }

    #[test]
    fn test_new_conversation_decodes_source_and_payload() {
        let payload = Bytes::from_static(&[
            0x34, 0x12, // id 0x1234
            10, 0, 0, 7, // 10.0.0.7
            0x90, 0x1f, // port 8080
            b'G', b'E', b'T',
        ]);

        let convo = NewConversation::decode(ConversationType::Http, payload).unwrap();
        assert_eq!(convo.id, 0x1234);
        assert_eq!(convo.source, "10.0.0.7:8080".parse().unwrap());
        assert_eq!(&convo.initial_data[..], b"GET");
    }

    #[test]
    fn test_new_conversation_truncated() {
        let err = NewConversation::decode(ConversationType::Http, Bytes::from_static(&[1, 0, 127]))
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                what: "new conversation",
                expected: 8,
                actual: 3
            }
        );
    }
}
