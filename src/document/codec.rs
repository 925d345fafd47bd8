//! # Document Binary Codec
//!
//! Encodes and decodes the tag/body layout described in the module docs.
//! Decoding consumes from a mutable byte-slice cursor so nested values
//! compose naturally; `decode(encode(v)) == v` for every value, including
//! field order inside documents.

use eyre::{bail, ensure, Result};

use super::value::{Array, DataType, Document, Value};

/// Number of bytes `encode_value` will produce for this value.
pub fn encoded_size(value: &Value, with_tag: bool) -> usize {
    let tag = usize::from(with_tag);
    tag + match value {
        Value::Null => 0,
        Value::Double(_) => 8,
        Value::String(s) => 4 + s.len(),
        Value::Document(doc) => {
            let mut size = 8;
            for (name, field) in doc.iter() {
                size += 2 + name.len() + encoded_size(field, true);
            }
            size
        }
        Value::Array(array) => {
            let mut size = 1 + 4;
            for element in array.iter() {
                size += encoded_size(element, false);
            }
            size
        }
        Value::Binary(b) => 4 + b.len(),
        Value::Boolean(_) => 1,
        Value::DateTime(_) => 8,
        Value::Int32(_) => 4,
        Value::Int64(_) => 8,
        Value::UInt64(_) => 8,
    }
}

/// Appends the encoding of `value` to `buffer`, optionally preceded by its
/// type tag.
pub fn encode_value(value: &Value, buffer: &mut Vec<u8>, with_tag: bool) {
    if with_tag {
        buffer.push(value.data_type() as u8);
    }
    match value {
        Value::Null => {}
        Value::Double(v) => buffer.extend_from_slice(&v.to_le_bytes()),
        Value::String(s) => {
            buffer.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buffer.extend_from_slice(s.as_bytes());
        }
        Value::Document(doc) => {
            buffer.extend_from_slice(&(doc.num_fields() as u64).to_le_bytes());
            for (name, field) in doc.iter() {
                buffer.extend_from_slice(&(name.len() as u16).to_le_bytes());
                buffer.extend_from_slice(name.as_bytes());
                encode_value(field, buffer, true);
            }
        }
        Value::Array(array) => {
            buffer.push(array.element_type() as u8);
            buffer.extend_from_slice(&(array.len() as u32).to_le_bytes());
            for element in array.iter() {
                encode_value(element, buffer, false);
            }
        }
        Value::Binary(b) => {
            buffer.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buffer.extend_from_slice(b);
        }
        Value::Boolean(v) => buffer.push(u8::from(*v)),
        Value::DateTime(v) => buffer.extend_from_slice(&v.to_le_bytes()),
        Value::Int32(v) => buffer.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => buffer.extend_from_slice(&v.to_le_bytes()),
        Value::UInt64(v) => buffer.extend_from_slice(&v.to_le_bytes()),
    }
}

/// Convenience wrapper: encodes a document, optionally with its leading
/// tag byte.
pub fn encode_document(document: &Document, with_tag: bool) -> Vec<u8> {
    let value = Value::Document(document.clone());
    let mut buffer = Vec::with_capacity(encoded_size(&value, with_tag));
    encode_value(&value, &mut buffer, with_tag);
    buffer
}

/// Decodes one tagged value from the front of `input`, advancing it.
pub fn decode_value(input: &mut &[u8]) -> Result<Value> {
    let tag = take_u8(input)?;
    let data_type = DataType::from_tag(tag)?;
    decode_body(input, data_type)
}

/// Decodes a document from `input`. With `expect_tag`, the leading byte
/// must be the document tag; otherwise the body starts immediately.
pub fn decode_document(mut input: &[u8], expect_tag: bool) -> Result<Document> {
    let input = &mut input;
    if expect_tag {
        let tag = take_u8(input)?;
        ensure!(
            tag == DataType::Document as u8,
            "expected document tag {}, got {}",
            DataType::Document as u8,
            tag
        );
    }
    match decode_body(input, DataType::Document)? {
        Value::Document(doc) => Ok(doc),
        _ => unreachable!("document body decodes to a document"),
    }
}

fn decode_body(input: &mut &[u8], data_type: DataType) -> Result<Value> {
    Ok(match data_type {
        DataType::Null => Value::Null,
        DataType::Double => Value::Double(f64::from_le_bytes(take_array::<8>(input)?)),
        DataType::String => {
            let len = u32::from_le_bytes(take_array::<4>(input)?) as usize;
            let bytes = take_bytes(input, len)?;
            Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| eyre::eyre!("string field is not valid UTF-8: {}", e))?,
            )
        }
        DataType::Document => {
            let count = u64::from_le_bytes(take_array::<8>(input)?);
            let mut doc = Document::new();
            for _ in 0..count {
                let name_len = u16::from_le_bytes(take_array::<2>(input)?) as usize;
                let name_bytes = take_bytes(input, name_len)?;
                let name = String::from_utf8(name_bytes.to_vec())
                    .map_err(|e| eyre::eyre!("field name is not valid UTF-8: {}", e))?;
                let value = decode_value(input)?;
                doc.insert(name, value);
            }
            Value::Document(doc)
        }
        DataType::Array => {
            let element_tag = take_u8(input)?;
            let element_type = DataType::from_tag(element_tag)?;
            let count = u32::from_le_bytes(take_array::<4>(input)?);
            let mut array = Array::new(element_type);
            for _ in 0..count {
                let element = decode_body(input, element_type)?;
                array.push(element)?;
            }
            Value::Array(array)
        }
        DataType::Binary => {
            let len = u32::from_le_bytes(take_array::<4>(input)?) as usize;
            Value::Binary(take_bytes(input, len)?.to_vec())
        }
        DataType::Boolean => Value::Boolean(take_u8(input)? != 0),
        DataType::DateTime => Value::DateTime(i64::from_le_bytes(take_array::<8>(input)?)),
        DataType::Int32 => Value::Int32(i32::from_le_bytes(take_array::<4>(input)?)),
        DataType::Int64 => Value::Int64(i64::from_le_bytes(take_array::<8>(input)?)),
        DataType::UInt64 => Value::UInt64(u64::from_le_bytes(take_array::<8>(input)?)),
    })
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    if input.is_empty() {
        bail!("unexpected end of document data");
    }
    let byte = input[0];
    *input = &input[1..];
    Ok(byte)
}

fn take_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    ensure!(
        input.len() >= len,
        "unexpected end of document data: wanted {} bytes, {} remain",
        len,
        input.len()
    );
    let (taken, rest) = input.split_at(len);
    *input = rest;
    Ok(taken)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    Ok(take_bytes(input, N)?.try_into().unwrap())
}
