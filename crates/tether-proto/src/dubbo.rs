//! Dubbo codec.
//!
//! Wire format (16-byte header, big-endian):
//!
//! ```text
//! magic(2)=0xdabb flag(1) status(1) request_id(8) body_len(4) body
//! ```
//!
//! `flag` carries the request, two-way and event bits plus the
//! serialisation id in its low five bits. A request body is a hessian2
//! invocation:
//!
//! ```text
//! dubbo_version path version method parameter_desc args... attachments
//! ```
//!
//! The leading strings are surfaced as frame headers. Frame headers and the
//! timeout travel in the trailing attachment map. Response bodies and
//! request bodies that are not invocations pass through untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    check_frame_size, response_from_frame, Frame, FrameKind, ProtocolConfig, TransportProtocol,
};
use crate::error::ProtocolError;
use crate::hessian::{write_string_map, HessianReader};
use crate::message::{RemoteError, RpcRequest, RpcResponse};

const MAGIC: u16 = 0xdabb;
const HEADER_LEN: usize = 16;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;

/// Hessian2 serialisation id.
pub const HESSIAN2_SERIALIZATION: u8 = 2;

/// Response status: OK.
pub const STATUS_OK: u16 = 20;

/// Header keys filled from the request body.
pub const HEADER_DUBBO_VERSION: &str = "dubbo";
pub const HEADER_SERVICE: &str = "service";
pub const HEADER_VERSION: &str = "version";
pub const HEADER_METHOD: &str = "method";

const SERVICE_KEYS: [&str; 4] = [
    HEADER_DUBBO_VERSION,
    HEADER_SERVICE,
    HEADER_VERSION,
    HEADER_METHOD,
];

/// Attachment carrying the call timeout in milliseconds.
pub const ATTACHMENT_TIMEOUT: &str = "timeout";

/// Dubbo codec.
#[derive(Debug, Clone, Default)]
pub struct Dubbo;

impl Dubbo {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// A serialised request body split at its attachment map.
#[derive(Debug)]
struct Invocation {
    service: Vec<(String, String)>,
    /// End of the argument values, where the attachment map starts.
    args_end: usize,
    attachments: Vec<(String, String)>,
}

impl Invocation {
    fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = HessianReader::new(body);
        let mut service = Vec::with_capacity(SERVICE_KEYS.len());
        for key in SERVICE_KEYS {
            if let Some(value) = reader.read_string()? {
                service.push((key.to_owned(), value));
            }
        }
        let desc = reader.read_string()?.unwrap_or_default();
        for _ in 0..argument_count(&desc)? {
            reader.skip_value()?;
        }
        let args_end = reader.position();
        let attachments = if reader.is_empty() {
            Vec::new()
        } else {
            reader.read_string_map()?
        };
        if !reader.is_empty() {
            return Err(ProtocolError::InvalidHessian(
                "trailing bytes after attachments".into(),
            ));
        }
        Ok(Self {
            service,
            args_end,
            attachments,
        })
    }
}

/// Counts the parameters in a JVM method descriptor such as `Ljava/lang/String;[I`.
fn argument_count(desc: &str) -> Result<usize, ProtocolError> {
    let invalid = || ProtocolError::InvalidHessian(format!("invalid parameter descriptor {desc}"));
    let mut count = 0;
    let mut chars = desc.chars();
    while let Some(c) = chars.next() {
        match c {
            '[' => continue,
            'Z' | 'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' => {}
            'L' => {
                if !chars.by_ref().any(|c| c == ';') {
                    return Err(invalid());
                }
            }
            _ => return Err(invalid()),
        }
        count += 1;
    }
    Ok(count)
}

fn upsert(entries: &mut Vec<(String, String)>, key: &str, value: String) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key.to_owned(), value)),
    }
}

/// Rewrites the attachment map of a request body with the frame's headers
/// and timeout.
fn attach(frame: &Frame) -> Bytes {
    let invocation = match Invocation::parse(&frame.body) {
        Ok(invocation) => invocation,
        Err(e) => {
            tracing::debug!(error = %e, "dubbo body is not an invocation, sending without attachments");
            return frame.body.clone();
        }
    };

    let mut attachments = invocation.attachments;
    for (key, value) in &frame.headers {
        if !SERVICE_KEYS.contains(&key.as_str()) {
            upsert(&mut attachments, key, value.clone());
        }
    }
    if frame.timeout_ms > 0 {
        upsert(&mut attachments, ATTACHMENT_TIMEOUT, frame.timeout_ms.to_string());
    }
    if attachments.is_empty() {
        return frame.body.clone();
    }

    let mut body = Vec::with_capacity(frame.body.len() + 64);
    body.extend_from_slice(&frame.body[..invocation.args_end]);
    write_string_map(&mut body, &attachments);
    Bytes::from(body)
}

impl TransportProtocol for Dubbo {
    fn name(&self) -> &'static str {
        "dubbo"
    }

    fn init(&mut self, _config: &ProtocolConfig) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn to_frame(&self, req: &RpcRequest) -> Frame {
        let mut frame = Frame::new(FrameKind::Request);
        frame.timeout_ms = req.timeout_ms;
        frame.codec = HESSIAN2_SERIALIZATION;
        frame.body = req.data.clone();

        match Invocation::parse(&req.data) {
            Ok(invocation) => {
                frame.headers = invocation.service;
                frame.headers.extend(invocation.attachments);
            }
            Err(e) => tracing::debug!(error = %e, "dubbo body carries no service metadata"),
        }
        if let Some((_, service)) = frame.headers.iter().find(|(k, _)| k == HEADER_SERVICE) {
            frame.class = service.clone();
        }
        for (key, value) in req.header.iter() {
            frame.set_header(key, value);
        }
        frame
    }

    fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let body = match frame.kind {
            FrameKind::Request | FrameKind::Oneway => attach(frame),
            FrameKind::Heartbeat | FrameKind::Response => frame.body.clone(),
        };
        let total = HEADER_LEN + body.len();
        check_frame_size(total)?;

        let serialization = frame.codec & SERIALIZATION_MASK;
        let (flag, status) = match frame.kind {
            FrameKind::Request => (FLAG_REQUEST | FLAG_TWO_WAY | serialization, 0),
            FrameKind::Oneway => (FLAG_REQUEST | serialization, 0),
            FrameKind::Heartbeat => (FLAG_REQUEST | FLAG_TWO_WAY | FLAG_EVENT | serialization, 0),
            FrameKind::Response => {
                let status = u8::try_from(frame.status).map_err(|_| {
                    ProtocolError::InvalidFrameHeader(format!("status {} out of range", frame.status))
                })?;
                (serialization, status)
            }
        };

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(MAGIC);
        buf.put_u8(flag);
        buf.put_u8(status);
        buf.put_u64(frame.request_id);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() >= 2 {
            let magic = u16::from_be_bytes([buf[0], buf[1]]);
            if magic != MAGIC {
                return Err(ProtocolError::UnknownProtocol(magic));
            }
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        let total = HEADER_LEN + body_len;
        check_frame_size(total)?;
        if buf.len() < total {
            return Ok(None);
        }

        let mut raw = buf.split_to(total).freeze();
        raw.advance(2);
        let flag = raw.get_u8();
        let status = raw.get_u8();
        let request_id = raw.get_u64();
        raw.advance(4);
        let body = raw;

        let kind = if flag & FLAG_REQUEST == 0 {
            FrameKind::Response
        } else if flag & FLAG_EVENT != 0 {
            FrameKind::Heartbeat
        } else if flag & FLAG_TWO_WAY == 0 {
            FrameKind::Oneway
        } else {
            FrameKind::Request
        };

        let mut frame = Frame::new(kind);
        frame.request_id = request_id;
        frame.status = u16::from(status);
        frame.codec = flag & SERIALIZATION_MASK;
        if matches!(kind, FrameKind::Request | FrameKind::Oneway) {
            if let Ok(invocation) = Invocation::parse(&body) {
                frame.headers = invocation.service;
                for (key, value) in invocation.attachments {
                    if key == ATTACHMENT_TIMEOUT {
                        frame.timeout_ms = value.parse().unwrap_or_default();
                    } else {
                        frame.set_header(key, value);
                    }
                }
            }
            if let Some(service) = frame.header(HEADER_SERVICE) {
                frame.class = service.to_owned();
            }
        }
        frame.body = body;
        Ok(Some(frame))
    }

    fn from_frame(&self, frame: Frame) -> Result<RpcResponse, ProtocolError> {
        if !frame.is_response() {
            return Err(ProtocolError::UnexpectedFrame("dubbo request in place of a response"));
        }
        let status = frame.status;
        let mut response = response_from_frame(frame);
        if status == STATUS_OK {
            response.success = true;
        } else {
            response.error = Some(RemoteError {
                status,
                message: format!("dubbo error code {status}"),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hessian::write_string;

    fn request_body() -> Vec<u8> {
        let mut body = Vec::new();
        write_string(&mut body, "2.0.2");
        write_string(&mut body, "io.mosn.layotto");
        write_string(&mut body, "v1");
        write_string(&mut body, "Call");
        write_string(&mut body, "");
        body
    }

    #[test]
    fn init_accepts_anything() {
        assert!(Dubbo::new().init(&ProtocolConfig::new()).is_ok());
    }

    #[test]
    fn to_frame_merges_service_metadata() {
        let req = RpcRequest::new("1", "Hello", request_body())
            .with_timeout_ms(100)
            .with_header("env", "test")
            .with_header("name", "bolt");

        let frame = Dubbo::new().to_frame(&req);
        assert_eq!(frame.class, "io.mosn.layotto");

        let mut headers: Vec<String> = frame
            .headers
            .iter()
            .filter(|(k, _)| k != HEADER_DUBBO_VERSION)
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        headers.sort();
        assert_eq!(
            headers.join(","),
            "env:test,method:Call,name:bolt,service:io.mosn.layotto,version:v1"
        );
    }

    #[test]
    fn headers_and_timeout_travel_as_attachments() {
        let dubbo = Dubbo::new();
        let req = RpcRequest::new("1", "Call", request_body())
            .with_timeout_ms(1234)
            .with_header("env", "test");
        let mut frame = dubbo.to_frame(&req);
        frame.request_id = 3;

        let mut buf = BytesMut::from(&dubbo.encode(&frame).unwrap()[..]);
        let decoded = dubbo.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header("env"), Some("test"));
        assert_eq!(decoded.header(HEADER_METHOD), Some("Call"));
        assert_eq!(decoded.header(ATTACHMENT_TIMEOUT), None);
        assert_eq!(decoded.timeout_ms, 1234);
        assert_eq!(decoded.class, "io.mosn.layotto");
        assert!(decoded.body.starts_with(&request_body()));
    }

    #[test]
    fn caller_headers_override_existing_attachments() {
        let mut body = request_body();
        write_string_map(
            &mut body,
            &[
                ("group".to_owned(), "blue".to_owned()),
                ("env".to_owned(), "prod".to_owned()),
            ],
        );
        let dubbo = Dubbo::new();
        let frame = dubbo.to_frame(&RpcRequest::new("1", "Call", body).with_header("env", "test"));
        assert_eq!(frame.header("group"), Some("blue"));

        let mut buf = BytesMut::from(&dubbo.encode(&frame).unwrap()[..]);
        let decoded = dubbo.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header("group"), Some("blue"));
        assert_eq!(decoded.header("env"), Some("test"));
        assert_eq!(decoded.timeout_ms, 0);
    }

    #[test]
    fn arguments_precede_attachments() {
        let mut body = Vec::new();
        for s in ["2.0.2", "io.mosn.layotto", "v1", "Call", "Ljava/lang/String;I"] {
            write_string(&mut body, s);
        }
        write_string(&mut body, "arg");
        body.push(0x95);
        let args_end = body.len();

        let dubbo = Dubbo::new();
        let frame = dubbo.to_frame(&RpcRequest::new("1", "Call", body.clone()).with_header("env", "test"));
        let wire = dubbo.encode(&frame).unwrap();
        assert_eq!(&wire[HEADER_LEN..HEADER_LEN + args_end], &body[..]);

        let decoded = dubbo.decode(&mut BytesMut::from(&wire[..])).unwrap().unwrap();
        assert_eq!(decoded.header("env"), Some("test"));
    }

    #[test]
    fn counts_descriptor_parameters() {
        assert_eq!(argument_count("").unwrap(), 0);
        assert_eq!(argument_count("Ljava/lang/String;[IJ").unwrap(), 3);
        assert_eq!(argument_count("[[Ljava/lang/Object;").unwrap(), 1);
        assert!(argument_count("Ljava/lang/String").is_err());
        assert!(argument_count("java.lang.String").is_err());
    }

    #[test]
    fn opaque_bodies_pass_through_encode() {
        let dubbo = Dubbo::new();
        let frame = dubbo.to_frame(
            &RpcRequest::new("1", "Call", "hello")
                .with_timeout_ms(100)
                .with_header("env", "test"),
        );
        let wire = dubbo.encode(&frame).unwrap();
        assert_eq!(&wire[HEADER_LEN..], b"hello");
    }

    #[test]
    fn to_frame_tolerates_opaque_bodies() {
        let req = RpcRequest::new("1", "Hello", vec![0x90, 0x91]).with_header("env", "test");
        let frame = Dubbo::new().to_frame(&req);
        assert_eq!(frame.headers, vec![("env".to_owned(), "test".to_owned())]);
    }

    #[test]
    fn from_frame_maps_status() {
        let dubbo = Dubbo::new();

        let mut ok = Frame::new(FrameKind::Response);
        ok.status = STATUS_OK;
        ok.headers.push(("key1".into(), "value1".into()));
        let resp = dubbo.from_frame(ok).unwrap();
        assert!(resp.success);
        assert_eq!(resp.header.get("key1"), "value1");

        let mut bad = Frame::new(FrameKind::Response);
        bad.status = 40;
        let resp = dubbo.from_frame(bad).unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().message.contains("dubbo error code 40"));
    }

    #[test]
    fn request_survives_the_wire() {
        let dubbo = Dubbo::new();
        let mut frame = dubbo.to_frame(&RpcRequest::new("1", "Call", request_body()));
        frame.request_id = u64::from(u32::MAX) + 5;

        let mut buf = BytesMut::from(&dubbo.encode(&frame).unwrap()[..]);
        let decoded = dubbo.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.request_id, frame.request_id);
        assert_eq!(decoded.body, frame.body);
        assert_eq!(decoded.header(HEADER_METHOD), Some("Call"));
    }

    #[test]
    fn response_survives_the_wire_in_pieces() {
        let dubbo = Dubbo::new();
        let mut frame = Frame::new(FrameKind::Request);
        frame.request_id = 12;
        frame.codec = HESSIAN2_SERIALIZATION;
        let reply = frame.reply(STATUS_OK, "answer");
        let wire = dubbo.encode(&reply).unwrap();

        let mut buf = BytesMut::from(&wire[..10]);
        assert!(dubbo.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[10..]);

        let decoded = dubbo.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.status, STATUS_OK);
        assert_eq!(decoded.request_id, 12);
        assert_eq!(&decoded.body[..], b"answer");
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::from(&[0xca, 0xfe, 0, 0][..]);
        assert!(matches!(
            Dubbo::new().decode(&mut buf),
            Err(ProtocolError::UnknownProtocol(0xcafe))
        ));
    }
}
