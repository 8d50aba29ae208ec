//! SOFA bolt codecs (protocol v1 and v2).
//!
//! Request layout (big-endian):
//!
//! ```text
//! v1: proto(1) type(1) cmd(2) ver(1) id(4) codec(1)           timeout(4) class_len(2) header_len(2) content_len(4)
//! v2: proto(1) ver1(1) type(1) cmd(2) ver(1) id(4) codec(1) switch(1) timeout(4) class_len(2) header_len(2) content_len(4)
//! ```
//!
//! Responses carry a 2-byte status in place of the 4-byte timeout. The
//! fixed part is followed by the class name, the header block
//! (`key_len(4) key value_len(4) value` repeated) and the content.
//! A v2 frame whose switch has the CRC bit set ends with a 4-byte CRC32.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    check_frame_size, response_from_frame, Frame, FrameKind, ProtocolConfig, TransportProtocol,
};
use crate::error::ProtocolError;
use crate::message::{RemoteError, RpcRequest, RpcResponse};

const PROTOCOL_V1: u8 = 0x01;
const PROTOCOL_V2: u8 = 0x02;
const V2_VERSION: u8 = 0x01;
const COMMAND_VERSION: u8 = 0x01;

const TYPE_RESPONSE: u8 = 0x00;
const TYPE_REQUEST: u8 = 0x01;
const TYPE_ONEWAY: u8 = 0x02;

const CMD_HEARTBEAT: u16 = 0x00;
const CMD_REQUEST: u16 = 0x01;
const CMD_RESPONSE: u16 = 0x02;

const SWITCH_CRC: u8 = 0x01;
const CRC_LEN: usize = 4;

/// Hessian2 serialisation identifier.
pub const HESSIAN2_SERIALIZE: u8 = 1;

/// Bolt response status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x00;
    pub const ERROR: u16 = 0x01;
    pub const SERVER_EXCEPTION: u16 = 0x02;
    pub const UNKNOWN: u16 = 0x03;
    pub const SERVER_THREADPOOL_BUSY: u16 = 0x04;
    pub const ERROR_COMM: u16 = 0x05;
    pub const NO_PROCESSOR: u16 = 0x06;
    pub const TIMEOUT: u16 = 0x07;
    pub const CLIENT_SEND_ERROR: u16 = 0x08;
    pub const CODEC_EXCEPTION: u16 = 0x09;
    pub const CONNECTION_CLOSED: u16 = 0x10;
    pub const SERVER_SERIAL_EXCEPTION: u16 = 0x11;
    pub const SERVER_DESERIAL_EXCEPTION: u16 = 0x12;
}

/// Bolt protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoltVersion {
    V1,
    V2,
}

impl BoltVersion {
    const fn protocol_code(self) -> u8 {
        match self {
            Self::V1 => PROTOCOL_V1,
            Self::V2 => PROTOCOL_V2,
        }
    }

    const fn type_offset(self) -> usize {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    const fn fixed_len(self, request: bool) -> usize {
        match (self, request) {
            (Self::V1, true) => 22,
            (Self::V1, false) => 20,
            (Self::V2, true) => 24,
            (Self::V2, false) => 22,
        }
    }
}

/// Bolt codec. Every request carries the configured class name.
#[derive(Debug, Clone)]
pub struct Bolt {
    version: BoltVersion,
    class_name: String,
}

impl Bolt {
    /// Creates a bolt v1 codec.
    #[must_use]
    pub const fn v1() -> Self {
        Self {
            version: BoltVersion::V1,
            class_name: String::new(),
        }
    }

    /// Creates a bolt v2 codec.
    #[must_use]
    pub const fn v2() -> Self {
        Self {
            version: BoltVersion::V2,
            class_name: String::new(),
        }
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub const fn version(&self) -> BoltVersion {
        self.version
    }
}

/// Maps a bolt status onto the failure reported to the caller.
fn status_error(status: u16) -> Option<RemoteError> {
    let message = match status {
        status::SUCCESS => return None,
        status::SERVER_DESERIAL_EXCEPTION => {
            format!("bolt error code {status}, ServerDeserializeException")
        }
        status::SERVER_SERIAL_EXCEPTION => {
            format!("bolt error code {status}, ServerSerializeException")
        }
        status::CODEC_EXCEPTION => format!("bolt error code {status}, CodecException"),
        _ => format!("bolt error code {status}"),
    };
    Some(RemoteError { status, message })
}

fn encode_headers(headers: &[(String, String)]) -> Result<BytesMut, ProtocolError> {
    let mut block = BytesMut::new();
    for (key, value) in headers {
        let key_len = u32::try_from(key.len())
            .map_err(|_| ProtocolError::InvalidFrameHeader("header key too long".into()))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| ProtocolError::InvalidFrameHeader("header value too long".into()))?;
        block.put_u32(key_len);
        block.put_slice(key.as_bytes());
        block.put_u32(value_len);
        block.put_slice(value.as_bytes());
    }
    Ok(block)
}

fn take_string(block: &mut Bytes, what: &str) -> Result<String, ProtocolError> {
    if block.remaining() < 4 {
        return Err(ProtocolError::InvalidFrameHeader(format!("truncated {what} length")));
    }
    let len = block.get_u32() as usize;
    if block.remaining() < len {
        return Err(ProtocolError::InvalidFrameHeader(format!("truncated {what}")));
    }
    let raw = block.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::InvalidFrameHeader(format!("{what} is not utf-8")))
}

fn decode_headers(mut block: Bytes) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut headers = Vec::new();
    while block.has_remaining() {
        let key = take_string(&mut block, "header key")?;
        let value = take_string(&mut block, "header value")?;
        headers.push((key, value));
    }
    Ok(headers)
}

impl TransportProtocol for Bolt {
    fn name(&self) -> &'static str {
        match self.version {
            BoltVersion::V1 => "bolt",
            BoltVersion::V2 => "boltv2",
        }
    }

    fn init(&mut self, config: &ProtocolConfig) -> Result<(), ProtocolError> {
        if config.is_empty() {
            return Err(ProtocolError::InvalidConfig("missing bolt classname".into()));
        }
        let class = config
            .get("class")
            .ok_or_else(|| ProtocolError::InvalidConfig("bolt need class".into()))?;
        let class = class
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidConfig("bolt class not string".into()))?;
        self.class_name = class.to_owned();
        Ok(())
    }

    fn to_frame(&self, req: &RpcRequest) -> Frame {
        let mut frame = Frame::new(FrameKind::Request);
        frame.class.clone_from(&self.class_name);
        frame.timeout_ms = req.timeout_ms;
        frame.codec = HESSIAN2_SERIALIZE;
        frame.body = req.data.clone();
        frame.headers = req.header.iter().map(|(k, v)| (k.to_owned(), v)).collect();
        frame
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let request = !frame.is_response();
        let header_block = encode_headers(&frame.headers)?;
        let class = frame.class.as_bytes();
        let total = self.version.fixed_len(request) + class.len() + header_block.len() + frame.body.len();
        check_frame_size(total)?;

        let class_len = u16::try_from(class.len())
            .map_err(|_| ProtocolError::InvalidFrameHeader("class name too long".into()))?;
        let header_len = u16::try_from(header_block.len())
            .map_err(|_| ProtocolError::InvalidFrameHeader("header block too long".into()))?;

        let (cmd_type, cmd_code) = match frame.kind {
            FrameKind::Request => (TYPE_REQUEST, CMD_REQUEST),
            FrameKind::Oneway => (TYPE_ONEWAY, CMD_REQUEST),
            FrameKind::Response => (TYPE_RESPONSE, CMD_RESPONSE),
            FrameKind::Heartbeat => (TYPE_REQUEST, CMD_HEARTBEAT),
        };

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.version.protocol_code());
        if self.version == BoltVersion::V2 {
            buf.put_u8(V2_VERSION);
        }
        buf.put_u8(cmd_type);
        buf.put_u16(cmd_code);
        buf.put_u8(COMMAND_VERSION);
        // bolt request ids are 32 bits wide
        buf.put_u32(frame.request_id as u32);
        buf.put_u8(frame.codec);
        if self.version == BoltVersion::V2 {
            buf.put_u8(0);
        }
        if request {
            buf.put_u32(frame.timeout_ms);
        } else {
            buf.put_u16(frame.status);
        }
        buf.put_u16(class_len);
        buf.put_u16(header_len);
        buf.put_u32(frame.body.len() as u32);
        buf.put_slice(class);
        buf.put_slice(&header_block);
        buf.put_slice(&frame.body);
        Ok(buf.freeze())
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let type_offset = self.version.type_offset();
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != self.version.protocol_code() {
            return Err(ProtocolError::UnknownProtocol(u16::from(buf[0])));
        }
        if buf.len() <= type_offset {
            return Ok(None);
        }

        let request = match buf[type_offset] {
            TYPE_REQUEST | TYPE_ONEWAY => true,
            TYPE_RESPONSE => false,
            other => {
                return Err(ProtocolError::InvalidFrameHeader(format!(
                    "unknown command type {other}"
                )))
            }
        };
        let fixed_len = self.version.fixed_len(request);
        if buf.len() < fixed_len {
            return Ok(None);
        }

        let lens = fixed_len - 8;
        let class_len = u16::from_be_bytes([buf[lens], buf[lens + 1]]) as usize;
        let header_len = u16::from_be_bytes([buf[lens + 2], buf[lens + 3]]) as usize;
        let body_len =
            u32::from_be_bytes([buf[lens + 4], buf[lens + 5], buf[lens + 6], buf[lens + 7]]) as usize;
        let crc_len = match self.version {
            BoltVersion::V2 if buf[11] & SWITCH_CRC != 0 => CRC_LEN,
            _ => 0,
        };

        let total = fixed_len + class_len + header_len + body_len + crc_len;
        check_frame_size(total)?;
        if buf.len() < total {
            return Ok(None);
        }

        let mut raw = buf.split_to(total).freeze();
        raw.advance(type_offset);
        let cmd_type = raw.get_u8();
        let cmd_code = raw.get_u16();
        let _command_version = raw.get_u8();
        let request_id = u64::from(raw.get_u32());
        let codec = raw.get_u8();
        if self.version == BoltVersion::V2 {
            let _switch = raw.get_u8();
        }
        let (timeout_ms, status) = if request {
            (raw.get_u32(), 0)
        } else {
            (0, raw.get_u16())
        };
        raw.advance(8);

        let class = String::from_utf8(raw.split_to(class_len).to_vec())
            .map_err(|_| ProtocolError::InvalidFrameHeader("class name is not utf-8".into()))?;
        let headers = decode_headers(raw.split_to(header_len))?;
        let body = raw.split_to(body_len);

        let kind = match (cmd_type, cmd_code) {
            (TYPE_RESPONSE, _) => FrameKind::Response,
            (_, CMD_HEARTBEAT) => FrameKind::Heartbeat,
            (TYPE_ONEWAY, _) => FrameKind::Oneway,
            _ => FrameKind::Request,
        };

        Ok(Some(Frame {
            kind,
            request_id,
            timeout_ms,
            class,
            status,
            codec,
            headers,
            body,
        }))
    }

    fn from_frame(&self, frame: Frame) -> Result<RpcResponse, ProtocolError> {
        if !frame.is_response() {
            return Err(ProtocolError::UnexpectedFrame("bolt request in place of a response"));
        }
        let status = frame.status;
        let mut response = response_from_frame(frame);
        match status_error(status) {
            None => response.success = true,
            Some(err) => response.error = Some(err),
        }
        Ok(response)
    }
}
