//! Wire protocol framing, field encoding and message dispatch for pdnet.
//!
//! This crate turns typed outbound messages into length-prefixed frames and
//! turns a raw inbound byte buffer (one or more concatenated frames) back
//! into typed messages through a header-keyed [`MessageRegistry`].
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+--------------------------------+
//! | u16 length (LE)      | 1 + body length                |
//! +----------------------+--------------------------------+
//! | u8 header            | message type discriminator     |
//! +----------------------+--------------------------------+
//! | body                 | length - 1 bytes               |
//! +----------------------+--------------------------------+
//! ```
//!
//! All multi-byte integers are little-endian. Strings are a 7-bit encoded
//! byte count followed by UTF-8 bytes.
//!
//! ## Reserved headers
//!
//! - `0`: [`Header::Handshake`]
//! - `1`: [`Header::PingPong`]
//!
//! Application headers start at [`FIRST_APPLICATION_HEADER`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod messages;
pub mod registry;

// Re-export main types
pub use error::WireError;
pub use frame::{
    decode_frames, encode_frame, encode_message, take_complete_frames, Frame, FrameIter,
    LENGTH_PREFIX_SIZE, MAX_BODY_SIZE, MIN_FRAME_SIZE,
};
pub use messages::{
    HandshakeErrorCode, HandshakeRequest, HandshakeResponse, Header, PingPong,
    FIRST_APPLICATION_HEADER,
};
pub use registry::{Message, MessageRegistry, Response, ResponseReader, ResponseRef};
