//! Header-keyed message dispatch.
//!
//! Outbound messages implement [`Message`]; inbound messages implement
//! [`Response`] and are produced from a frame body by the [`ResponseReader`]
//! registered for the frame's header.

use crate::error::WireError;
use crate::frame::Frame;
use crate::messages::{HandshakeResponse, Header, PingPong};
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// A message that can be written into a frame
pub trait Message: fmt::Debug + Send + Sync {
    /// Header byte selecting the message type
    fn header(&self) -> u8;

    /// Append the body to `buf`
    fn write_body(&self, buf: &mut BytesMut);
}

/// A typed inbound message
pub trait Response: fmt::Debug + Send + Sync + 'static {
    /// Header byte this message was decoded from
    fn header(&self) -> u8;

    /// Upcast for downcasting to the concrete type
    fn as_any(&self) -> &dyn Any;
}

impl dyn Response {
    /// Downcast to a concrete response type
    pub fn downcast_ref<T: Response>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Check the concrete response type
    pub fn is<T: Response>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Shared handle to a decoded response
pub type ResponseRef = Arc<dyn Response>;

/// Decoder turning a frame body into a typed response
pub trait ResponseReader: Send + Sync {
    /// Decode `body` into a response
    fn read_response(&self, body: Bytes) -> Result<ResponseRef, WireError>;
}

impl<F> ResponseReader for F
where
    F: Fn(Bytes) -> Result<ResponseRef, WireError> + Send + Sync,
{
    fn read_response(&self, body: Bytes) -> Result<ResponseRef, WireError> {
        self(body)
    }
}

/// Maps header bytes to response readers
///
/// Readers are registered once at initialization; the registry is then
/// shared read-only by the decode path.
#[derive(Default)]
pub struct MessageRegistry {
    readers: HashMap<u8, Box<dyn ResponseReader>>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the reserved protocol messages registered
    pub fn with_protocol_messages() -> Self {
        let mut registry = Self::new();
        registry.readers.insert(
            Header::Handshake as u8,
            Box::new(|body: Bytes| -> Result<ResponseRef, WireError> {
                Ok(Arc::new(HandshakeResponse::decode(body)?))
            }),
        );
        registry.readers.insert(
            Header::PingPong as u8,
            Box::new(|_body: Bytes| -> Result<ResponseRef, WireError> { Ok(Arc::new(PingPong)) }),
        );
        registry
    }

    /// Register a reader for `header`
    ///
    /// Registering a second reader for the same header is a configuration
    /// error.
    pub fn register<R>(&mut self, header: u8, reader: R) -> Result<(), WireError>
    where
        R: ResponseReader + 'static,
    {
        if self.readers.contains_key(&header) {
            return Err(WireError::DuplicateHeader(header));
        }
        self.readers.insert(header, Box::new(reader));
        Ok(())
    }

    /// Check whether a reader is registered for `header`
    pub fn contains(&self, header: u8) -> bool {
        self.readers.contains_key(&header)
    }

    /// Decode a body with the reader registered for `header`
    pub fn read_response(&self, header: u8, body: Bytes) -> Result<ResponseRef, WireError> {
        match self.readers.get(&header) {
            Some(reader) => reader.read_response(body),
            None => {
                error!(header, "no handler for header");
                Err(WireError::UnknownHeader(header))
            }
        }
    }

    /// Decode a whole frame
    pub fn read_frame(&self, frame: Frame) -> Result<ResponseRef, WireError> {
        self.read_response(frame.header, frame.body)
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut headers: Vec<_> = self.readers.keys().copied().collect();
        headers.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("headers", &headers)
            .finish()
    }
}
