//! Canonical binary encoding for log records.
//!
//! A stable, deterministic layout: fields in fixed order, integers
//! little-endian, variable-length fields prefixed with a `u32` length. The
//! integrity tag is computed over the canonical portion; a full record is the
//! canonical bytes followed by the 32-byte tag.
//!
//! Any change to this layout is a log-format version bump: readers reject
//! versions they do not understand, and migrating a data directory requires an
//! explicit migration event.
//!
//! Layout (version 1):
//!
//! ```text
//! u8   format version
//! u64  sequence
//! str  event_id
//! str  event_type (canonical dotted name)
//! str  aggregate_id
//! str  agent_id
//! i64  timestamp_ms
//! u8   causation flag (0|1)   [str causation_id when 1]
//! str  payload (canonical JSON of the typed payload)
//! ---- integrity tag (32 bytes), records only ----
//! ```

use crate::error::EncodingError;
use crate::event::{Event, EventPayload, EventType};

/// Current log format version.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the integrity tag trailer in a record.
pub const TAG_LEN: usize = 32;

/// Encode the canonical portion of an event (everything but the tag).
///
/// This is the exact byte string the integrity chain MACs over.
#[must_use]
pub fn encode_canonical(event: &Event) -> Vec<u8> {
    let payload =
        serde_json::to_vec(&event.payload).expect("typed payloads always serialize");
    let mut out = Vec::with_capacity(64 + payload.len());
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&event.sequence.to_le_bytes());
    put_str(&mut out, &event.event_id);
    put_str(&mut out, event.event_type.as_str());
    put_str(&mut out, &event.aggregate_id);
    put_str(&mut out, &event.agent_id);
    out.extend_from_slice(&event.timestamp_ms.to_le_bytes());
    match &event.causation_id {
        Some(id) => {
            out.push(1);
            put_str(&mut out, id);
        }
        None => out.push(0),
    }
    put_bytes(&mut out, &payload);
    out
}

/// Encode a full record: canonical bytes plus the 32-byte tag trailer.
pub fn encode_record(event: &Event) -> Result<Vec<u8>, EncodingError> {
    let tag = decode_tag(&event.integrity_tag)?;
    let mut out = encode_canonical(event);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decode a full record produced by [`encode_record`].
pub fn decode_record(bytes: &[u8]) -> Result<Event, EncodingError> {
    if bytes.len() < TAG_LEN {
        return Err(EncodingError::Truncated { field: "tag" });
    }
    let (canonical, tag) = bytes.split_at(bytes.len() - TAG_LEN);
    let mut event = decode_canonical(canonical)?;
    event.integrity_tag = hex::encode(tag);
    Ok(event)
}

/// Decode the canonical portion. The returned event carries an empty tag.
pub fn decode_canonical(bytes: &[u8]) -> Result<Event, EncodingError> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8("version")?;
    if version != FORMAT_VERSION {
        return Err(EncodingError::UnsupportedVersion(version));
    }

    let sequence = reader.u64("sequence")?;
    let event_id = reader.str("event_id")?;
    let type_name = reader.str("event_type")?;
    let event_type =
        EventType::parse(&type_name).ok_or(EncodingError::UnknownEventType(type_name))?;
    let aggregate_id = reader.str("aggregate_id")?;
    let agent_id = reader.str("agent_id")?;
    let timestamp_ms = reader.i64("timestamp_ms")?;
    let causation_id = match reader.u8("causation_flag")? {
        0 => None,
        _ => Some(reader.str("causation_id")?),
    };
    let payload_bytes = reader.bytes("payload")?;
    let payload: EventPayload =
        serde_json::from_slice(&payload_bytes).map_err(|e| EncodingError::PayloadMismatch {
            event_type: event_type.as_str(),
            reason: e.to_string(),
        })?;
    if payload.event_type() != event_type {
        return Err(EncodingError::PayloadMismatch {
            event_type: event_type.as_str(),
            reason: format!("payload is for `{}`", payload.event_type()),
        });
    }
    if !reader.is_empty() {
        return Err(EncodingError::TrailingBytes);
    }

    Ok(Event {
        sequence,
        event_id,
        event_type,
        aggregate_id,
        agent_id,
        timestamp_ms,
        causation_id,
        payload,
        integrity_tag: String::new(),
    })
}

/// Parse a hex tag into its fixed-width byte form.
pub fn decode_tag(hex_tag: &str) -> Result<[u8; TAG_LEN], EncodingError> {
    let raw = hex::decode(hex_tag).map_err(|_| EncodingError::Truncated { field: "tag" })?;
    raw.try_into()
        .map_err(|_| EncodingError::Truncated { field: "tag" })
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], EncodingError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(EncodingError::Truncated { field })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, EncodingError> {
        Ok(self.take(1, field)?[0])
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, EncodingError> {
        let raw = self.take(8, field)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("len checked")))
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, EncodingError> {
        let raw = self.take(8, field)?;
        Ok(i64::from_le_bytes(raw.try_into().expect("len checked")))
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, EncodingError> {
        let len = self.take(4, field)?;
        let len = u32::from_le_bytes(len.try_into().expect("len checked")) as usize;
        Ok(self.take(len, field)?.to_vec())
    }

    fn str(&mut self, field: &'static str) -> Result<String, EncodingError> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw).map_err(|_| EncodingError::InvalidUtf8 { field })
    }
}
