//! # Document Value Model
//!
//! Self-describing values used as the default entry payload. A document is
//! an ordered list of named fields; each field holds one [`Value`], which
//! may itself be a document or a homogeneous array, nesting arbitrarily.
//!
//! ## Binary Layout
//!
//! Every value is a one-byte type tag followed by a type-specific body:
//!
//! ```text
//! Type        Tag  Body
//! ----------  ---  --------------------------------------------------
//! Null        0    -
//! Double      1    8 bytes IEEE-754 LE
//! String      2    [len: u32][bytes]
//! Document    3    [count: u64] then count x
//!                      [name_len: u16][name][tag: u8][body]
//! Array       4    [elem_tag: u8][count: u32] then count x body
//!                      (no per-element tags)
//! Binary      5    [len: u32][bytes]
//! Boolean     6    1 byte
//! DateTime    7    8 bytes (microseconds since the Unix epoch, i64 LE)
//! Int32       8    4 bytes LE
//! Int64       9    8 bytes LE
//! UInt64      10   8 bytes LE
//! ```
//!
//! A top-level document may be encoded with or without its leading tag
//! byte depending on context; both directions are offered by the codec.
//!
//! ## Module Organization
//!
//! - `value`: the [`Value`] / [`Document`] / [`Array`] types and typed
//!   accessors
//! - `codec`: binary encode/decode, the exact inverse of each other

mod codec;
mod value;

pub use codec::{
    decode_document, decode_value, encode_document, encode_value, encoded_size,
};
pub use value::{Array, DataType, Document, FromValue, Value};
