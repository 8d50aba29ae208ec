//! Frame model and the codec contract every wire protocol implements.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::{RpcRequest, RpcResponse};

/// Maximum frame size (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Protocol-specific extension config (`ext` in a channel config).
pub type ProtocolConfig = serde_json::Map<String, serde_json::Value>;

/// Direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A request expecting a response.
    Request,
    /// A request with no response.
    Oneway,
    /// A response to an earlier request.
    Response,
    /// A liveness probe.
    Heartbeat,
}

/// A decoded protocol frame.
///
/// Fields a protocol does not carry on the wire are left at their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub request_id: u64,
    /// Per-call timeout in milliseconds (requests only).
    pub timeout_ms: u32,
    /// Class or service name the remote dispatches on.
    pub class: String,
    /// Response status code (responses only).
    pub status: u16,
    /// Serialisation identifier.
    pub codec: u8,
    /// Header key/value pairs in wire order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    /// Creates an empty frame of the given kind.
    #[must_use]
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            request_id: 0,
            timeout_ms: 0,
            class: String::new(),
            status: 0,
            codec: 0,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Builds the response frame a remote would send back for `self`.
    #[must_use]
    pub fn reply(&self, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Response,
            request_id: self.request_id,
            timeout_ms: 0,
            class: self.class.clone(),
            status,
            codec: self.codec,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Returns the first value of header `key`.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets header `key`, replacing an existing entry.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self.kind, FrameKind::Response)
    }
}

/// A pluggable wire protocol.
///
/// `decode` is incremental: it returns `Ok(None)` until `buf` holds a whole
/// frame, and consumes exactly that frame's bytes when it returns one.
pub trait TransportProtocol: Send + Sync + fmt::Debug {
    /// Registered protocol name.
    fn name(&self) -> &'static str;

    /// Applies the protocol-specific `ext` config.
    fn init(&mut self, config: &ProtocolConfig) -> Result<(), ProtocolError>;

    /// Maps a request onto a frame. The request id is assigned by the channel.
    fn to_frame(&self, req: &RpcRequest) -> Frame;

    /// Serialises a frame into its wire bytes.
    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError>;

    /// Parses one frame off the front of `buf` if it is complete.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError>;

    /// Converts a response frame into a response.
    ///
    /// A non-success status is reported on the response, not as an `Err`.
    fn from_frame(&self, frame: Frame) -> Result<RpcResponse, ProtocolError>;
}

/// Rejects frames whose declared size exceeds [`MAX_MESSAGE_SIZE`].
pub(crate) fn check_frame_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Copies frame headers into a response header map.
pub(crate) fn response_from_frame(frame: Frame) -> RpcResponse {
    let mut response = RpcResponse {
        data: frame.body,
        ..RpcResponse::default()
    };
    for (key, value) in frame.headers {
        response.header.append(key, value);
    }
    response
}
