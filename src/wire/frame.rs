/// Framing and record types of the replication stream.
///
/// Each logical change travels as one frame:
///
/// ```text
/// +----------------------+------------------------------------------+
/// | body length: u32 LE  | body: bincode-encoded Vec<WireRecord>    |
/// +----------------------+------------------------------------------+
/// ```
///
/// Values are a closed tagged set ([`WireValue`]); a value's tag must match
/// the declared type of the column it is written to. A field sent without a
/// value empties the field on the receiving side.

use crate::column::{ColumnType, ColumnValue, Decimal};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use uuid::Uuid;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bool(bool),
    Decimal { mantissa: i128, scale: u8 },
    /// Seconds and nanoseconds since the Unix epoch, UTC
    DateTime { secs: i64, nanos: u32 },
    /// Nanoseconds carry the sign of the duration
    Duration { secs: i64, nanos: i32 },
    Uuid([u8; 16]),
    Byte(u8),
    Char(u16),
}

impl WireValue {
    /// Encode a column value; the empty sentinel has no wire form.
    pub fn from_column(value: &ColumnValue) -> Option<WireValue> {
        Some(match value {
            ColumnValue::Int16(v) => WireValue::Int16(*v),
            ColumnValue::Int32(v) => WireValue::Int32(*v),
            ColumnValue::Int64(v) => WireValue::Int64(*v),
            ColumnValue::Float32(v) => WireValue::Float32(*v),
            ColumnValue::Float64(v) => WireValue::Float64(*v),
            ColumnValue::String(v) => WireValue::String(v.clone()),
            ColumnValue::Bool(v) => WireValue::Bool(*v),
            ColumnValue::Decimal(v) => WireValue::Decimal {
                mantissa: v.mantissa(),
                scale: v.scale(),
            },
            ColumnValue::DateTime(v) => WireValue::DateTime {
                secs: v.timestamp(),
                nanos: v.timestamp_subsec_nanos(),
            },
            ColumnValue::Duration(v) => WireValue::Duration {
                secs: v.num_seconds(),
                nanos: v.subsec_nanos(),
            },
            ColumnValue::Uuid(v) => WireValue::Uuid(*v.as_bytes()),
            ColumnValue::Byte(v) => WireValue::Byte(*v),
            ColumnValue::Char(v) => WireValue::Char(*v),
            ColumnValue::Null => return None,
        })
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            WireValue::Int16(_) => ColumnType::Int16,
            WireValue::Int32(_) => ColumnType::Int32,
            WireValue::Int64(_) => ColumnType::Int64,
            WireValue::Float32(_) => ColumnType::Float32,
            WireValue::Float64(_) => ColumnType::Float64,
            WireValue::String(_) => ColumnType::String,
            WireValue::Bool(_) => ColumnType::Bool,
            WireValue::Decimal { .. } => ColumnType::Decimal,
            WireValue::DateTime { .. } => ColumnType::DateTime,
            WireValue::Duration { .. } => ColumnType::Duration,
            WireValue::Uuid(_) => ColumnType::Uuid,
            WireValue::Byte(_) => ColumnType::Byte,
            WireValue::Char(_) => ColumnType::Char,
        }
    }

    pub fn into_column(self) -> Result<ColumnValue> {
        Ok(match self {
            WireValue::Int16(v) => ColumnValue::Int16(v),
            WireValue::Int32(v) => ColumnValue::Int32(v),
            WireValue::Int64(v) => ColumnValue::Int64(v),
            WireValue::Float32(v) => ColumnValue::Float32(v),
            WireValue::Float64(v) => ColumnValue::Float64(v),
            WireValue::String(v) => ColumnValue::String(v),
            WireValue::Bool(v) => ColumnValue::Bool(v),
            WireValue::Decimal { mantissa, scale } => {
                if scale > Decimal::MAX_SCALE {
                    return Err(Error::Protocol(format!("decimal scale {} out of range", scale)));
                }
                ColumnValue::Decimal(Decimal::new(mantissa, scale))
            }
            WireValue::DateTime { secs, nanos } => {
                let ts: DateTime<Utc> = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
                    Error::Protocol(format!("timestamp {}.{:09} out of range", secs, nanos))
                })?;
                ColumnValue::DateTime(ts)
            }
            WireValue::Duration { secs, nanos } => {
                let duration = chrono::Duration::try_seconds(secs)
                    .and_then(|d| d.checked_add(&chrono::Duration::nanoseconds(nanos as i64)))
                    .ok_or_else(|| Error::Protocol(format!("duration {}s out of range", secs)))?;
                ColumnValue::Duration(duration)
            }
            WireValue::Uuid(bytes) => ColumnValue::Uuid(Uuid::from_bytes(bytes)),
            WireValue::Byte(v) => ColumnValue::Byte(v),
            WireValue::Char(v) => ColumnValue::Char(v),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field_id: u16,
    /// `None` empties the field
    pub value: Option<WireValue>,
}

impl FieldValue {
    pub fn set(field_id: u16, value: WireValue) -> Self {
        FieldValue {
            field_id,
            value: Some(value),
        }
    }

    pub fn clear(field_id: u16) -> Self {
        FieldValue { field_id, value: None }
    }

    /// Encode a column value; the empty sentinel becomes a cleared field.
    pub fn from_column(field_id: u16, value: &ColumnValue) -> Self {
        FieldValue {
            field_id,
            value: WireValue::from_column(value),
        }
    }

    /// Decode the value, `Null` for a cleared field.
    pub fn into_column(self) -> Result<ColumnValue> {
        match self.value {
            Some(value) => value.into_column(),
            None => Ok(ColumnValue::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireRecord {
    /// A new row with its initial values inline
    Add { row_id: u64, fields: Vec<FieldValue> },
    Update { row_id: u64, fields: Vec<FieldValue> },
    Delete { row_id: u64 },
}

impl WireRecord {
    pub fn row_id(&self) -> u64 {
        match self {
            WireRecord::Add { row_id, .. }
            | WireRecord::Update { row_id, .. }
            | WireRecord::Delete { row_id } => *row_id,
        }
    }
}

/// Serialize records into one length-prefixed frame.
pub fn encode_frame(records: &[WireRecord]) -> Result<Vec<u8>> {
    let body = bincode::serialize(records)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn write_frame<W: Write + ?Sized>(writer: &mut W, records: &[WireRecord]) -> Result<()> {
    writer.write_all(&encode_frame(records)?)?;
    Ok(())
}

pub fn decode_body(body: &[u8]) -> Result<Vec<WireRecord>> {
    Ok(bincode::deserialize(body)?)
}

/// Outcome of one attempt to read a frame.
#[derive(Debug, PartialEq)]
pub enum FrameRead {
    Frame(Vec<WireRecord>),
    /// The read timed out before a whole frame arrived
    Idle,
    /// The peer closed the stream on a frame boundary
    Closed,
}

/// Reads frames from a byte stream, keeping partial frames across timeouts.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        FrameReader {
            reader,
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read until a whole frame is buffered, the read times out, or the stream ends.
    ///
    /// End of stream inside a frame is an `UnexpectedEof` I/O error.
    pub fn next_frame(&mut self) -> Result<FrameRead> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(records) = self.take_frame()? {
                return Ok(FrameRead::Frame(records));
            }
            match self.reader.read(&mut chunk) {
                Ok(0) if self.buf.is_empty() => return Ok(FrameRead::Closed),
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame").into())
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(FrameRead::Idle)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<WireRecord>>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(Error::FrameTooLarge { len, max: self.max_len });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let records = decode_body(&self.buf[LEN_PREFIX..LEN_PREFIX + len])?;
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(records))
    }
}
