//! Reserved protocol messages: handshake and ping/pong.

use crate::codec::{get_bool, get_optional_string, get_string, get_u8, put_bool, put_string};
use crate::error::WireError;
use crate::registry::{Message, Response};
use bytes::{BufMut, Bytes, BytesMut};
use std::any::Any;

/// First header value available to applications; lower values are reserved
pub const FIRST_APPLICATION_HEADER: u8 = 10;

/// Reserved header values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    /// Handshake request/response
    Handshake = 0,
    /// Latency probe (same body-less message in both directions)
    PingPong = 1,
}

impl TryFrom<u8> for Header {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Header::Handshake),
            1 => Ok(Header::PingPong),
            _ => Err(WireError::UnknownHeader(value)),
        }
    }
}

/// Handshake sent by the client right after the transport connects
///
/// Body: `[app_id u8][auth_token?][api_version?][session_token?]`, each
/// optional string written only when present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Application identifier
    pub app_id: u8,
    /// Opaque authentication token
    pub auth_token: Option<String>,
    /// Client protocol/API version
    pub api_version: Option<String>,
    /// Token from a previous session, offered to resume it
    pub session_token: Option<String>,
}

impl HandshakeRequest {
    /// Decode a handshake request body (server side)
    ///
    /// Optional strings are read positionally, so a request that omits
    /// `auth_token` but carries `api_version` reads the version into
    /// `auth_token`. Clients always send the fields they have in order.
    pub fn decode(mut body: Bytes) -> Result<Self, WireError> {
        let app_id = get_u8(&mut body)?;
        let auth_token = get_optional_string(&mut body)?;
        let api_version = get_optional_string(&mut body)?;
        let session_token = get_optional_string(&mut body)?;

        Ok(Self {
            app_id,
            auth_token,
            api_version,
            session_token,
        })
    }
}

impl Message for HandshakeRequest {
    fn header(&self) -> u8 {
        Header::Handshake as u8
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.app_id);
        for field in [&self.auth_token, &self.api_version, &self.session_token] {
            if let Some(value) = field.as_deref().filter(|v| !v.is_empty()) {
                put_string(buf, value);
            }
        }
    }
}

/// Reason a handshake was rejected
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeErrorCode {
    /// Client API version not supported
    WrongVersion = 1,
    /// Resumption token unknown or expired
    InvalidSessionToken = 2,
    /// Any other rejection
    OtherError = 3,
}

impl TryFrom<u8> for HandshakeErrorCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HandshakeErrorCode::WrongVersion),
            2 => Ok(HandshakeErrorCode::InvalidSessionToken),
            3 => Ok(HandshakeErrorCode::OtherError),
            _ => Err(WireError::Code(value)),
        }
    }
}

/// Server answer to a [`HandshakeRequest`]
///
/// Body: `[success bool]` then `[session_token]` on success or
/// `[error][error_code u8]` on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResponse {
    /// Session established or resumed
    Accepted {
        /// Token to offer when resuming after a reconnect
        session_token: String,
    },
    /// Handshake refused
    Rejected {
        /// Human readable reason
        error: String,
        /// Machine readable reason
        code: HandshakeErrorCode,
    },
}

impl HandshakeResponse {
    /// Whether the handshake succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, HandshakeResponse::Accepted { .. })
    }

    /// Session token issued on success
    pub fn session_token(&self) -> Option<&str> {
        match self {
            HandshakeResponse::Accepted { session_token } => Some(session_token),
            HandshakeResponse::Rejected { .. } => None,
        }
    }

    /// Rejection code on failure
    pub fn error_code(&self) -> Option<HandshakeErrorCode> {
        match self {
            HandshakeResponse::Accepted { .. } => None,
            HandshakeResponse::Rejected { code, .. } => Some(*code),
        }
    }

    /// Decode a handshake response body
    pub fn decode(mut body: Bytes) -> Result<Self, WireError> {
        if get_bool(&mut body)? {
            let session_token = get_string(&mut body)?;
            return Ok(HandshakeResponse::Accepted { session_token });
        }

        let error = get_string(&mut body)?;
        let code = HandshakeErrorCode::try_from(get_u8(&mut body)?)?;
        Ok(HandshakeResponse::Rejected { error, code })
    }
}

impl Message for HandshakeResponse {
    fn header(&self) -> u8 {
        Header::Handshake as u8
    }

    fn write_body(&self, buf: &mut BytesMut) {
        match self {
            HandshakeResponse::Accepted { session_token } => {
                put_bool(buf, true);
                put_string(buf, session_token);
            }
            HandshakeResponse::Rejected { error, code } => {
                put_bool(buf, false);
                put_string(buf, error);
                buf.put_u8(*code as u8);
            }
        }
    }
}

impl Response for HandshakeResponse {
    fn header(&self) -> u8 {
        Header::Handshake as u8
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Ping request and pong reply; the body is empty both ways
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingPong;

impl Message for PingPong {
    fn header(&self) -> u8 {
        Header::PingPong as u8
    }

    fn write_body(&self, _buf: &mut BytesMut) {}
}

impl Response for PingPong {
    fn header(&self) -> u8 {
        Header::PingPong as u8
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_frames, encode_message};

    fn body_of(message: &dyn Message) -> Bytes {
        let frame = decode_frames(encode_message(message).unwrap())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(frame.header, message.header());
        frame.body
    }

    #[test]
    fn test_handshake_request_layout() {
        let request = HandshakeRequest {
            app_id: 7,
            auth_token: Some("tok".to_string()),
            api_version: Some("1.2".to_string()),
            session_token: None,
        };

        let body = body_of(&request);
        assert_eq!(&body[..], &[7, 3, b't', b'o', b'k', 3, b'1', b'.', b'2']);
        assert_eq!(HandshakeRequest::decode(body).unwrap(), request);
    }

    #[test]
    fn test_handshake_request_skips_empty_fields() {
        let request = HandshakeRequest {
            app_id: 1,
            auth_token: Some(String::new()),
            api_version: None,
            session_token: None,
        };
        assert_eq!(&body_of(&request)[..], &[1]);

        let decoded = HandshakeRequest::decode(Bytes::from_static(&[1])).unwrap();
        assert_eq!(decoded.auth_token, None);
        assert_eq!(decoded.session_token, None);
    }

    #[test]
    fn test_handshake_request_with_resumption() {
        let request = HandshakeRequest {
            app_id: 2,
            auth_token: Some("auth".to_string()),
            api_version: Some("v1".to_string()),
            session_token: Some("abc".to_string()),
        };
        let decoded = HandshakeRequest::decode(body_of(&request)).unwrap();
        assert_eq!(decoded.session_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_handshake_response_success() {
        let response = HandshakeResponse::Accepted {
            session_token: "abc".to_string(),
        };
        let decoded = HandshakeResponse::decode(body_of(&response)).unwrap();
        assert!(decoded.is_success());
        assert_eq!(decoded.session_token(), Some("abc"));
        assert_eq!(decoded.error_code(), None);
    }

    #[test]
    fn test_handshake_response_failure() {
        let response = HandshakeResponse::Rejected {
            error: "bad version".to_string(),
            code: HandshakeErrorCode::WrongVersion,
        };
        let body = body_of(&response);
        assert_eq!(body[0], 0);
        assert_eq!(*body.last().unwrap(), 1);

        let decoded = HandshakeResponse::decode(body).unwrap();
        assert!(!decoded.is_success());
        assert_eq!(decoded.error_code(), Some(HandshakeErrorCode::WrongVersion));
    }

    #[test]
    fn test_handshake_response_bad_code() {
        let body = Bytes::from_static(&[0, 1, b'x', 9]);
        assert_eq!(HandshakeResponse::decode(body), Err(WireError::Code(9)));
    }

    #[test]
    fn test_handshake_response_truncated() {
        let body = Bytes::from_static(&[1, 5, b'a']);
        assert!(matches!(
            HandshakeResponse::decode(body),
            Err(WireError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_ping_pong_is_empty() {
        assert!(body_of(&PingPong).is_empty());
        assert_eq!(Header::try_from(1).unwrap(), Header::PingPong);
        assert!(Header::try_from(FIRST_APPLICATION_HEADER).is_err());
    }
}
