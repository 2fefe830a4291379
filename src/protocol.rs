// Copyright 2020 Joyent, Inc.

//! Frame codec for the bidirectional protocol.
//!
//! Every frame starts with a one byte discriminator. Query and Answer
//! frames carry a fixed-shape body, Ping and Shutdown frames carry none.
//! All integers are big-endian.

use std::io::{Error, ErrorKind};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on an encoded JSON payload, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Longest method name a Query frame can carry.
pub const MAX_METHOD_NAME_LEN: usize = u8::max_value() as usize;

const FP_OFF_REQUEST_ID: usize = 0x1;
const FP_OFF_QUERY_NAME_LEN: usize = 0x9;
const FP_OFF_QUERY_NAME: usize = 0xa;
const FP_OFF_ANSWER_STATUS: usize = 0x9;
const FP_OFF_ANSWER_DATALEN: usize = 0xa;
const FP_ANSWER_HEADER_SZ: usize = 0xe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FrameKind {
    Shutdown = 0x00,
    /// `'A'`
    Answer = 0x41,
    /// `'P'`
    Ping = 0x50,
    /// `'Q'`
    Query = 0x51,
}

/// Outcome of a remote execution, carried in every Answer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ExecutionStatus {
    Executed = 2,
    /// The remote worker queue stayed full for the whole push timeout.
    Dropped = 3,
    /// The method is not registered remotely, or its handler panicked.
    NotFound = 4,
    /// The result did not fit in the remote's maximum message size.
    Oversized = 5,
}

impl ExecutionStatus {
    pub fn to_byte(self) -> u8 {
        ToPrimitive::to_u8(&self).unwrap_or(0)
    }

    pub fn from_byte(b: u8) -> Option<ExecutionStatus> {
        FromPrimitive::from_u8(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FastFrame {
    Query {
        request_id: u64,
        method: String,
        payload: Bytes,
    },
    Answer {
        request_id: u64,
        status: u8,
        payload: Bytes,
    },
    Ping,
    Shutdown,
}

impl FastFrame {
    pub fn query(request_id: u64, method: &str, payload: Bytes) -> FastFrame {
        FastFrame::Query {
            request_id,
            method: method.to_string(),
            payload,
        }
    }

    pub fn answer(
        request_id: u64,
        status: ExecutionStatus,
        payload: Bytes,
    ) -> FastFrame {
        FastFrame::Answer {
            request_id,
            status: status.to_byte(),
            payload,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            FastFrame::Query { .. } => FrameKind::Query,
            FastFrame::Answer { .. } => FrameKind::Answer,
            FastFrame::Ping => FrameKind::Ping,
            FastFrame::Shutdown => FrameKind::Shutdown,
        }
    }
}

/// Serializes a JSON value for use as a frame payload.
pub fn encode_payload(value: &Value) -> Result<Bytes, io::Error> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
        let msg = format!("failed to encode JSON payload: {}", e);
        Error::new(ErrorKind::InvalidInput, msg)
    })
}

/// Parses a frame payload. An empty payload is JSON `null`.
pub fn decode_payload(data_buf: &[u8]) -> Result<Value, io::Error> {
    if data_buf.is_empty() {
        return Ok(Value::Null);
    }
    match str::from_utf8(data_buf) {
        Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
            let msg = "Failed to parse data payload as JSON";
            Error::new(ErrorKind::InvalidData, msg)
        }),
        Err(_) => {
            let msg = "Failed to parse data payload as UTF-8";
            Err(Error::new(ErrorKind::InvalidData, msg))
        }
    }
}

fn invalid_data<S: Into<String>>(msg: S) -> Error {
    Error::new(ErrorKind::InvalidData, msg.into())
}

/// Encoder and decoder for [`FastFrame`]s.
///
/// The decoder refuses any payload whose declared length exceeds
/// `max_message_size` before buffering it.
#[derive(Debug, Clone, Copy)]
pub struct FastRpc {
    max_message_size: u32,
}

impl FastRpc {
    pub fn new(max_message_size: u32) -> FastRpc {
        FastRpc { max_message_size }
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    fn check_data_length(&self, data_len: usize) -> Result<(), io::Error> {
        if data_len > self.max_message_size as usize {
            let msg = format!(
                "declared payload of {} bytes exceeds the {} byte limit",
                data_len, self.max_message_size
            );
            Err(invalid_data(msg))
        } else {
            Ok(())
        }
    }

    fn decode_query(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastFrame>, io::Error> {
        if buf.len() < FP_OFF_QUERY_NAME {
            return Ok(None);
        }
        let name_len = buf[FP_OFF_QUERY_NAME_LEN] as usize;
        let off_datalen = FP_OFF_QUERY_NAME + name_len;
        if buf.len() < off_datalen + 4 {
            return Ok(None);
        }
        let data_len =
            BigEndian::read_u32(&buf[off_datalen..off_datalen + 4]) as usize;
        self.check_data_length(data_len)?;

        let frame_len = off_datalen + 4 + data_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        frame.advance(FP_OFF_REQUEST_ID);
        let request_id = frame.get_u64();
        frame.advance(1);
        let name = frame.split_to(name_len);
        let method = str::from_utf8(&name)
            .map_err(|_| invalid_data("Failed to parse method name as UTF-8"))?
            .to_string();
        frame.advance(4);

        Ok(Some(FastFrame::Query {
            request_id,
            method,
            payload: frame.freeze(),
        }))
    }

    fn decode_answer(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastFrame>, io::Error> {
        if buf.len() < FP_ANSWER_HEADER_SZ {
            return Ok(None);
        }
        let data_len = BigEndian::read_u32(
            &buf[FP_OFF_ANSWER_DATALEN..FP_OFF_ANSWER_DATALEN + 4],
        ) as usize;
        self.check_data_length(data_len)?;

        let frame_len = FP_ANSWER_HEADER_SZ + data_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let request_id =
            BigEndian::read_u64(&buf[FP_OFF_REQUEST_ID..FP_OFF_ANSWER_STATUS]);
        let status = buf[FP_OFF_ANSWER_STATUS];
        let mut frame = buf.split_to(frame_len);
        frame.advance(FP_ANSWER_HEADER_SZ);

        Ok(Some(FastFrame::Answer {
            request_id,
            status,
            payload: frame.freeze(),
        }))
    }
}

impl Default for FastRpc {
    fn default() -> Self {
        FastRpc::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FastRpc {
    type Item = FastFrame;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, io::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let kind: FrameKind =
            FromPrimitive::from_u8(buf[0]).ok_or_else(|| {
                invalid_data(format!("invalid frame discriminator {:#04x}", buf[0]))
            })?;

        match kind {
            FrameKind::Query => self.decode_query(buf),
            FrameKind::Answer => self.decode_answer(buf),
            FrameKind::Ping => {
                buf.advance(1);
                Ok(Some(FastFrame::Ping))
            }
            FrameKind::Shutdown => {
                buf.advance(1);
                Ok(Some(FastFrame::Shutdown))
            }
        }
    }
}

impl Encoder<FastFrame> for FastRpc {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: FastFrame,
        buf: &mut BytesMut,
    ) -> Result<(), io::Error> {
        let kind_u8 = ToPrimitive::to_u8(&item.kind())
            .ok_or_else(|| Error::new(ErrorKind::Other, "Invalid frame kind"))?;

        match item {
            FastFrame::Query {
                request_id,
                method,
                payload,
            } => {
                if method.len() > MAX_METHOD_NAME_LEN {
                    let msg = format!(
                        "method name of {} bytes does not fit a Query frame",
                        method.len()
                    );
                    return Err(Error::new(ErrorKind::InvalidInput, msg));
                }
                let payload_len = payload_len_u32(&payload)?;
                buf.reserve(FP_OFF_QUERY_NAME + method.len() + 4 + payload.len());
                buf.put_u8(kind_u8);
                buf.put_u64(request_id);
                buf.put_u8(method.len() as u8);
                buf.put_slice(method.as_bytes());
                buf.put_u32(payload_len);
                buf.put_slice(&payload);
            }
            FastFrame::Answer {
                request_id,
                status,
                payload,
            } => {
                let payload_len = payload_len_u32(&payload)?;
                buf.reserve(FP_ANSWER_HEADER_SZ + payload.len());
                buf.put_u8(kind_u8);
                buf.put_u64(request_id);
                buf.put_u8(status);
                buf.put_u32(payload_len);
                buf.put_slice(&payload);
            }
            FastFrame::Ping | FastFrame::Shutdown => buf.put_u8(kind_u8),
        }
        Ok(())
    }
}

fn payload_len_u32(payload: &Bytes) -> Result<u32, io::Error> {
    if payload.len() > u32::max_value() as usize {
        Err(Error::new(ErrorKind::InvalidInput, "payload too large to frame"))
    } else {
        Ok(payload.len() as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use rand::seq::SliceRandom;
    use rand::Rng;
    use serde_json::{json, Map};

    fn random_string<G: Gen>(g: &mut G, len: usize) -> String {
        std::iter::repeat(())
            .map(|()| g.sample(rand::distributions::Alphanumeric))
            .take(len)
            .collect()
    }

    fn nested_object<G: Gen>(g: &mut G) -> Value {
        let k_len = g.gen::<u8>() as usize;
        let v_len = g.gen::<u8>() as usize;
        let k = random_string(g, k_len);
        let v = random_string(g, v_len);
        let count = g.gen::<u64>();
        let mut inner_obj = Map::new();
        inner_obj.insert(String::from("value"), Value::String(v));
        inner_obj.insert(String::from("count"), json!(count));
        let mut obj = Map::new();
        obj.insert(k, Value::Object(inner_obj));
        Value::Object(obj)
    }

    #[derive(Clone, Debug)]
    struct ArbFrame(FastFrame);

    impl Arbitrary for ArbFrame {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let request_id = g.gen::<u64>();
            let name_len = g.gen_range(1, 64);
            let method = random_string(g, name_len);
            let payload = encode_payload(&nested_object(g))
                .expect("failed to encode arbitrary payload");
            let statuses = [
                ExecutionStatus::Executed,
                ExecutionStatus::Dropped,
                ExecutionStatus::NotFound,
                ExecutionStatus::Oversized,
            ];
            let frame = match g.gen_range(0, 4) {
                0 => FastFrame::query(request_id, &method, payload),
                1 => FastFrame::answer(
                    request_id,
                    *statuses.choose(g).unwrap_or(&ExecutionStatus::Executed),
                    payload,
                ),
                2 => FastFrame::Ping,
                _ => FastFrame::Shutdown,
            };
            ArbFrame(frame)
        }
    }

    fn encode(frame: FastFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        FastRpc::default()
            .encode(frame, &mut buf)
            .expect("failed to encode frame");
        buf
    }

    quickcheck! {
        fn prop_decode_returns_encoded_frame(frame: ArbFrame) -> bool {
            let mut buf = encode(frame.0.clone());
            match FastRpc::default().decode(&mut buf) {
                Ok(Some(decoded)) => decoded == frame.0 && buf.is_empty(),
                _ => false,
            }
        }

        fn prop_strict_prefix_needs_more_bytes(frame: ArbFrame) -> bool {
            let full = encode(frame.0);
            (0..full.len()).all(|cut| {
                let mut partial = BytesMut::from(&full[..cut]);
                match FastRpc::default().decode(&mut partial) {
                    Ok(None) => partial.len() == cut,
                    _ => false,
                }
            })
        }
    }

    #[test]
    fn query_wire_layout() {
        let payload = encode_payload(&json!({"x": 1})).unwrap();
        let buf = encode(FastFrame::query(7, "echo", payload));

        let mut expected = vec![b'Q', 0, 0, 0, 0, 0, 0, 0, 7, 4];
        expected.extend_from_slice(b"echo");
        expected.extend_from_slice(&[0, 0, 0, 7]);
        expected.extend_from_slice(b"{\"x\":1}");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn answer_wire_layout() {
        let buf = encode(FastFrame::answer(
            0x0102,
            ExecutionStatus::Dropped,
            Bytes::new(),
        ));
        assert_eq!(&buf[..], &[b'A', 0, 0, 0, 0, 0, 0, 1, 2, 3, 0, 0, 0, 0][..]);
    }

    #[test]
    fn control_frames_are_single_bytes() {
        assert_eq!(&encode(FastFrame::Shutdown)[..], &[0u8][..]);
        assert_eq!(&encode(FastFrame::Ping)[..], &[b'P'][..]);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = encode(FastFrame::Ping);
        buf.extend_from_slice(&encode(FastFrame::answer(
            9,
            ExecutionStatus::Executed,
            Bytes::from_static(b"true"),
        )));
        buf.extend_from_slice(&encode(FastFrame::Shutdown));

        let mut codec = FastRpc::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FastFrame::Ping));
        match codec.decode(&mut buf).unwrap() {
            Some(FastFrame::Answer {
                request_id,
                status,
                payload,
            }) => {
                assert_eq!(request_id, 9);
                assert_eq!(status, 2);
                assert_eq!(decode_payload(&payload).unwrap(), json!(true));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(FastFrame::Shutdown));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_discriminator_is_fatal() {
        let mut buf = BytesMut::from(&b"Zgarbage"[..]);
        let err = FastRpc::default().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn declared_length_over_limit_is_fatal() {
        let payload = Bytes::from(vec![b'1'; 64]);
        let mut buf = encode(FastFrame::answer(1, ExecutionStatus::Executed, payload));
        let err = FastRpc::new(32).decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn non_utf8_method_name_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Q');
        buf.put_u64(1);
        buf.put_u8(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_u32(0);
        let err = FastRpc::default().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn long_method_name_is_rejected_by_encoder() {
        let method = "m".repeat(MAX_METHOD_NAME_LEN + 1);
        let frame = FastFrame::query(1, &method, Bytes::new());
        let mut buf = BytesMut::new();
        let err = FastRpc::default().encode(frame, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_is_null() {
        assert_eq!(decode_payload(b"").unwrap(), Value::Null);
        assert!(decode_payload(b"{not json").is_err());
    }
}
