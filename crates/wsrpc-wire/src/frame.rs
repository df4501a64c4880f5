//! RPC frame codec.
//!
//! Every frame travels as exactly one binary WebSocket message, so no length
//! prefix is needed. The message boundary is the frame boundary.
//!
//! ```text
//! byte 0        kind: 1=request 2=response 3=error 4=ping 5=pong
//! request:      u64 BE id | u16 BE method length | method | payload
//! response:     u64 BE id | payload
//! error:        u64 BE id | UTF-8 message
//! ping / pong:  empty body
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::WireError;

/// Longest method name a request frame can carry.
pub const MAX_METHOD_LEN: usize = u16::MAX as usize;

const ID_LEN: usize = 8;

/// The kind byte at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
    Error = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameKind {
    fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            3 => Ok(FrameKind::Error),
            4 => Ok(FrameKind::Ping),
            5 => Ok(FrameKind::Pong),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical unit of the RPC protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke `method` on the peer. `id` is echoed in the reply.
    Request {
        id: u64,
        method: String,
        payload: Vec<u8>,
    },
    /// Successful result of the request with the same `id`.
    Response { id: u64, payload: Vec<u8> },
    /// Failed result of the request with the same `id`.
    Error { id: u64, message: String },
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Request { .. } => FrameKind::Request,
            Self::Response { .. } => FrameKind::Response,
            Self::Error { .. } => FrameKind::Error,
            Self::Ping => FrameKind::Ping,
            Self::Pong => FrameKind::Pong,
        }
    }

    /// Correlation id, for the frames that carry one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => {
                Some(*id)
            }
            Self::Ping | Self::Pong => None,
        }
    }

    /// Serialize into the body of one binary WebSocket message.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind() as u8);
        match self {
            Self::Request {
                id,
                method,
                payload,
            } => {
                if method.len() > MAX_METHOD_LEN {
                    return Err(WireError::MethodTooLong {
                        len: method.len(),
                        max: MAX_METHOD_LEN,
                    });
                }
                buf.put_u64(*id);
                buf.put_u16(method.len() as u16);
                buf.put_slice(method.as_bytes());
                buf.put_slice(payload);
            }
            Self::Response { id, payload } => {
                buf.put_u64(*id);
                buf.put_slice(payload);
            }
            Self::Error { id, message } => {
                buf.put_u64(*id);
                buf.put_slice(message.as_bytes());
            }
            Self::Ping | Self::Pong => {}
        }
        Ok(buf.to_vec())
    }

    /// Parse the body of one binary WebSocket message.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(WireError::EmptyFrame);
        }
        let kind = FrameKind::try_from(buf.get_u8())?;

        match kind {
            FrameKind::Ping | FrameKind::Pong => {
                if buf.has_remaining() {
                    return Err(WireError::TrailingBytes(kind.name()));
                }
                Ok(if kind == FrameKind::Ping {
                    Self::Ping
                } else {
                    Self::Pong
                })
            }
            FrameKind::Request => {
                ensure_len(kind, buf.remaining(), ID_LEN + 2)?;
                let id = buf.get_u64();
                let method_len = buf.get_u16() as usize;
                ensure_len(kind, buf.remaining(), method_len)?;
                let method = std::str::from_utf8(&buf[..method_len])
                    .map_err(|_| WireError::InvalidUtf8("method name"))?
                    .to_string();
                buf.advance(method_len);
                Ok(Self::Request {
                    id,
                    method,
                    payload: buf.to_vec(),
                })
            }
            FrameKind::Response => {
                ensure_len(kind, buf.remaining(), ID_LEN)?;
                let id = buf.get_u64();
                Ok(Self::Response {
                    id,
                    payload: buf.to_vec(),
                })
            }
            FrameKind::Error => {
                ensure_len(kind, buf.remaining(), ID_LEN)?;
                let id = buf.get_u64();
                let message = String::from_utf8(buf.to_vec())
                    .map_err(|_| WireError::InvalidUtf8("error message"))?;
                Ok(Self::Error { id, message })
            }
        }
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Request {
                method, payload, ..
            } => ID_LEN + 2 + method.len() + payload.len(),
            Self::Response { payload, .. } => ID_LEN + payload.len(),
            Self::Error { message, .. } => ID_LEN + message.len(),
            Self::Ping | Self::Pong => 0,
        }
    }
}

fn ensure_len(kind: FrameKind, got: usize, needed: usize) -> Result<(), WireError> {
    if got < needed {
        return Err(WireError::Truncated {
            kind: kind.name(),
            needed,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let frame = Frame::Request {
            id: 7,
            method: "Echo".to_string(),
            payload: vec![0xAA, 0xBB],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], FrameKind::Request as u8);
        assert_eq!(&bytes[1..9], &7u64.to_be_bytes());
        assert_eq!(&bytes[9..11], &4u16.to_be_bytes());
        assert_eq!(&bytes[11..15], b"Echo");
        assert_eq!(&bytes[15..], &[0xAA, 0xBB]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_response_preserves_payload_bytes() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = Frame::Response {
            id: u64::MAX,
            payload: payload.clone(),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Response { id, payload: got } => {
                assert_eq!(id, u64::MAX);
                assert_eq!(got, payload);
            }
            other => panic!("Expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_frame() {
        let frame = Frame::Error {
            id: 42,
            message: "method not found: Nope".to_string(),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.id(), Some(42));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_keepalive_frames_are_one_byte() {
        assert_eq!(Frame::Ping.encode().unwrap(), vec![4]);
        assert_eq!(Frame::Pong.encode().unwrap(), vec![5]);
        assert_eq!(Frame::decode(&[4]).unwrap(), Frame::Ping);
        assert_eq!(Frame::Pong.id(), None);
    }

    #[test]
    fn test_empty_request_payload() {
        let frame = Frame::Request {
            id: 1,
            method: "Ping".to_string(),
            payload: vec![],
        };
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(Frame::decode(&[]), Err(WireError::EmptyFrame)));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(matches!(
            Frame::decode(&[0x7F, 0, 0]),
            Err(WireError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_request() {
        // id present, method length claims 10 bytes but only 2 follow
        let mut bytes = vec![1];
        bytes.extend_from_slice(&9u64.to_be_bytes());
        bytes.extend_from_slice(&10u16.to_be_bytes());
        bytes.extend_from_slice(b"ab");
        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::Truncated {
                kind: "request",
                needed: 10,
                got: 2
            })
        ));

        assert!(matches!(
            Frame::decode(&[2, 0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_ping_with_body() {
        assert!(matches!(
            Frame::decode(&[4, 0]),
            Err(WireError::TrailingBytes("ping"))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_utf8_method() {
        let mut bytes = vec![1];
        bytes.extend_from_slice(&1u64.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::InvalidUtf8("method name"))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_method() {
        let frame = Frame::Request {
            id: 1,
            method: "m".repeat(MAX_METHOD_LEN + 1),
            payload: vec![],
        };
        assert!(matches!(
            frame.encode(),
            Err(WireError::MethodTooLong { .. })
        ));
    }

    #[test]
    fn test_msgpack_payload_survives_framing() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Body {
            text: String,
            delay_ms: u64,
        }
        let body = Body {
            text: "bodyarg".to_string(),
            delay_ms: 500,
        };
        let frame = Frame::Request {
            id: 3,
            method: "Echo".to_string(),
            payload: rmp_serde::to_vec_named(&body).unwrap(),
        };
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Request { payload, .. } => {
                let got: Body = rmp_serde::from_slice(&payload).unwrap();
                assert_eq!(got, body);
            }
            other => panic!("Expected Request, got {other:?}"),
        }
    }
}
