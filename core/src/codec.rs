//! Binary wire framing.
//!
//! ```text
//! u32 totalLength      whole frame, including this field
//! u32 metaLength
//! [u8] meta            JSON {sender, destination, data, isResponse, trace, reqId}
//! u32 binLength
//! [u8] bin             binary values lifted out of `data`, in encounter order
//! ```
//!
//! All integers are big-endian. Inside `meta`, each binary value is replaced by
//! the marker string `##BINARY_<offset>_<length>##` pointing into `bin`.
//! Frames can be concatenated back to back; a reader advances by `totalLength`.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::address::Address;
use crate::event::Event;
use crate::value::{Payload, Value};
use crate::{ArborError, Result};

/// Three length fields.
pub const FRAME_OVERHEAD: usize = 12;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const MARKER_PREFIX: &str = "##BINARY_";
const MARKER_SUFFIX: &str = "##";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    sender: Address,
    destination: Address,
    data: serde_json::Value,
    #[serde(default)]
    is_response: bool,
    #[serde(default)]
    trace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    req_id: Option<u64>,
}

pub fn encode(event: &Event) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(event, &mut dst)?;
    Ok(dst.freeze())
}

/// Appends one frame to `dst`.
pub fn encode_into(event: &Event, dst: &mut BytesMut) -> Result<()> {
    let mut segments = Vec::new();
    let mut bin_len = 0usize;
    let mut data = serde_json::Map::new();
    for (key, value) in event.data.as_map() {
        data.insert(key.clone(), extract(value, &mut segments, &mut bin_len));
    }

    let meta = Meta {
        sender: event.sender.clone(),
        destination: event.destination.clone(),
        data: serde_json::Value::Object(data),
        is_response: event.is_response,
        trace: event.trace,
        req_id: event.req_id(),
    };
    let meta = serde_json::to_vec(&meta)?;

    let total = FRAME_OVERHEAD + meta.len() + bin_len;
    let total_field = u32::try_from(total).map_err(|_| {
        ArborError::ProtocolDecode(format!("frame of {total} bytes exceeds the length field"))
    })?;

    dst.reserve(total);
    dst.put_u32(total_field);
    dst.put_u32(meta.len() as u32);
    dst.put_slice(&meta);
    dst.put_u32(bin_len as u32);
    for segment in &segments {
        dst.put_slice(segment);
    }
    Ok(())
}

/// Decodes exactly one frame; `frame` must hold nothing else.
pub fn decode(frame: Bytes) -> Result<Event> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(ArborError::ProtocolDecode(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let total = read_u32(&frame, 0);
    if total != frame.len() {
        return Err(ArborError::ProtocolDecode(format!(
            "invalid frame length: expected {total}, got {}",
            frame.len()
        )));
    }

    let meta_len = read_u32(&frame, 4);
    let meta_end = 8usize
        .checked_add(meta_len)
        .filter(|end| end + 4 <= frame.len())
        .ok_or_else(|| ArborError::ProtocolDecode(format!("meta length {meta_len} overruns frame")))?;
    let meta: Meta = serde_json::from_slice(&frame[8..meta_end])
        .map_err(|e| ArborError::ProtocolDecode(format!("bad metadata: {e}")))?;

    let bin_len = read_u32(&frame, meta_end);
    let bin_start = meta_end + 4;
    if bin_start + bin_len != frame.len() {
        return Err(ArborError::ProtocolDecode(format!(
            "binary length {bin_len} does not match frame"
        )));
    }
    let bin = frame.slice(bin_start..);

    let data = match restore(meta.data, &bin)? {
        Value::Object(map) => Payload::from_map(map),
        _ => return Err(ArborError::ProtocolDecode("data is not an object".into())),
    };

    let mut event = Event::with_flags(
        meta.sender,
        meta.destination,
        data,
        meta.is_response,
        meta.trace,
    )?;
    event.req_id = meta.req_id;
    Ok(event)
}

/// Concatenates frames, as used when returning a queued batch.
pub fn encode_sequence<'a, I>(events: I) -> Result<Bytes>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut dst = BytesMut::new();
    for event in events {
        encode_into(event, &mut dst)?;
    }
    Ok(dst.freeze())
}

pub fn decode_sequence(mut buf: Bytes) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            return Err(ArborError::ProtocolDecode("truncated frame header".into()));
        }
        let total = read_u32(&buf, 0);
        if total < FRAME_OVERHEAD || total > buf.len() {
            return Err(ArborError::ProtocolDecode(format!(
                "frame length {total} out of bounds ({} bytes left)",
                buf.len()
            )));
        }
        events.push(decode(buf.split_to(total))?);
    }
    Ok(events)
}

/// Stream reassembly for byte-oriented transports.
///
/// A malformed frame body is reported and skipped; a bad length header loses
/// stream synchronisation, so the buffer is discarded.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Event;
    type Error = ArborError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let total = read_u32(src, 0);
        if total < FRAME_OVERHEAD || total > self.max_frame_len {
            src.clear();
            return Err(ArborError::ProtocolDecode(format!(
                "frame length {total} outside [{FRAME_OVERHEAD}, {}]",
                self.max_frame_len
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        decode(frame).map(Some)
    }
}

impl Encoder<Event> for FrameCodec {
    type Error = ArborError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<()> {
        encode_into(&item, dst)
    }
}

fn read_u32(buf: &[u8], at: usize) -> usize {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize
}

fn marker(offset: usize, len: usize) -> String {
    format!("{MARKER_PREFIX}{offset}_{len}{MARKER_SUFFIX}")
}

fn parse_marker(s: &str) -> Option<(usize, usize)> {
    let inner = s.strip_prefix(MARKER_PREFIX)?.strip_suffix(MARKER_SUFFIX)?;
    let (offset, len) = inner.split_once('_')?;
    let digits = |t: &str| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit());
    if !digits(offset) || !digits(len) {
        return None;
    }
    Some((offset.parse().ok()?, len.parse().ok()?))
}

fn extract(value: &Value, segments: &mut Vec<Bytes>, offset: &mut usize) -> serde_json::Value {
    match value {
        Value::Bytes(b) => {
            let m = marker(*offset, b.len());
            *offset += b.len();
            segments.push(b.clone());
            serde_json::Value::String(m)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| extract(v, segments, offset))
            .collect(),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), extract(v, segments, offset));
            }
            serde_json::Value::Object(out)
        }
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
    }
}

fn restore(json: serde_json::Value, bin: &Bytes) -> Result<Value> {
    Ok(match json {
        serde_json::Value::String(s) => match parse_marker(&s) {
            Some((offset, len)) => {
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= bin.len())
                    .ok_or_else(|| {
                        ArborError::ProtocolDecode(format!(
                            "binary marker {s} outside {} byte segment",
                            bin.len()
                        ))
                    })?;
                Value::Bytes(bin.slice(offset..end))
            }
            None => Value::String(s),
        },
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| restore(v, bin))
                .collect::<Result<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| restore(v, bin).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>>>()?,
        ),
        other => Value::from(other),
    })
}
