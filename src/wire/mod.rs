//! Replication of a table's update stream over a byte stream.
//!
//! A [`TableEncoder`] subscribes to a table and writes length-prefixed frames;
//! a [`TableDecoder`] reads them back and applies them to a local [`Table`].
//! Column names never travel: both ends share a [`FieldMapping`] assigning
//! each column a numeric field id.
//!
//! [`Table`]: crate::table::Table

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod frame;

pub use config::{DecoderConfig, FieldIndex, FieldMapping, DEFAULT_MAX_FRAME_LEN};
pub use decoder::{DecoderHandle, TableDecoder};
pub use encoder::{SharedBuffer, TableEncoder};
pub use frame::{FieldValue, FrameRead, FrameReader, WireRecord, WireValue};
