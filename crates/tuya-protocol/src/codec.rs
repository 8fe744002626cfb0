//! Datapoint value codec
//!
//! Converts between typed [`DatapointValue`]s and the data section of a
//! [`Frame`]. Multi-byte numbers are big-endian and accumulate by shifting the
//! running value left 8 bits and adding each successive byte.

use crate::frame::Frame;
use crate::types::{DataType, DatapointValue, ProtocolError};
use bytes::Bytes;

/// Encode a value into an outbound frame
///
/// `dp` is accepted as a plain integer because datapoint tables are authored
/// as configuration; anything outside 0..=255 is rejected.
#[allow(clippy::missing_errors_doc)]
pub fn encode(
    transaction_id: u8,
    dp: u32,
    datatype: DataType,
    value: &DatapointValue,
) -> Result<Frame, ProtocolError> {
    let dp = u8::try_from(dp).map_err(|_| ProtocolError::InvalidDatapointId(dp))?;
    let data = encode_data(datatype, value)?;

    if data.len() > usize::from(u16::MAX) {
        return Err(invalid(datatype, format!("{} bytes exceeds frame maximum", data.len())));
    }

    Ok(Frame::new(transaction_id, dp, datatype, data))
}

/// Decode the data section of a frame
#[allow(clippy::missing_errors_doc)]
pub fn decode(frame: &Frame) -> Result<DatapointValue, ProtocolError> {
    decode_data(frame.datatype, &frame.data)
}

/// Decode from a raw datatype tag, as delivered by transports that hand over
/// already-split frame fields
#[allow(clippy::missing_errors_doc)]
pub fn decode_parts(datatype: u8, data: &[u8]) -> Result<DatapointValue, ProtocolError> {
    decode_data(DataType::try_from(datatype)?, data)
}

fn encode_data(datatype: DataType, value: &DatapointValue) -> Result<Bytes, ProtocolError> {
    match (datatype, value) {
        (DataType::Raw, DatapointValue::Raw(data)) => Ok(data.clone()),
        (DataType::Bool, DatapointValue::Bool(v)) => Ok(Bytes::copy_from_slice(&[u8::from(*v)])),
        (DataType::Value, DatapointValue::Value(v)) => Ok(Bytes::from(number_to_bytes(*v, 4))),
        (DataType::String, DatapointValue::String(s)) => s
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| {
                    invalid(datatype, format!("character {c:?} is outside the single-byte range"))
                })
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from),
        (DataType::Enum, DatapointValue::Enum(v)) => Ok(Bytes::copy_from_slice(&[*v])),
        (DataType::Bitmap, DatapointValue::Bitmap(v)) => {
            Ok(Bytes::from(number_to_bytes(*v, bitmap_width(*v))))
        }
        (datatype, value) => Err(invalid(
            datatype,
            format!("value {value} does not match the datatype"),
        )),
    }
}

fn decode_data(datatype: DataType, data: &[u8]) -> Result<DatapointValue, ProtocolError> {
    match datatype {
        DataType::Raw => Ok(DatapointValue::Raw(Bytes::copy_from_slice(data))),
        DataType::Bool => Ok(DatapointValue::Bool(single_byte(datatype, data)? == 0x01)),
        DataType::Value => {
            if data.len() != 4 {
                return Err(invalid(datatype, format!("expected 4 bytes, got {}", data.len())));
            }
            Ok(DatapointValue::Value(bytes_to_number(data)))
        }
        DataType::String => Ok(DatapointValue::String(
            data.iter().map(|&b| char::from(b)).collect(),
        )),
        DataType::Enum => Ok(DatapointValue::Enum(single_byte(datatype, data)?)),
        DataType::Bitmap => {
            if data.is_empty() || data.len() > 4 {
                return Err(invalid(datatype, format!("expected 1-4 bytes, got {}", data.len())));
            }
            Ok(DatapointValue::Bitmap(bytes_to_number(data)))
        }
    }
}

/// Accumulate big-endian bytes into a number
fn bytes_to_number(chunks: &[u8]) -> u32 {
    chunks
        .iter()
        .fold(0u32, |value, &byte| (value << 8) + u32::from(byte))
}

/// Inverse of [`bytes_to_number`] for a fixed width
fn number_to_bytes(value: u32, width: usize) -> Vec<u8> {
    (0..width)
        .rev()
        .map(|i| ((value >> (8 * i)) & 0xFF) as u8)
        .collect()
}

/// Narrowest of 1, 2 or 4 bytes that holds the bitmap
fn bitmap_width(value: u32) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 4,
    }
}

fn single_byte(datatype: DataType, data: &[u8]) -> Result<u8, ProtocolError> {
    match data {
        [b] => Ok(*b),
        _ => Err(invalid(datatype, format!("expected 1 byte, got {}", data.len()))),
    }
}

fn invalid(datatype: DataType, reason: String) -> ProtocolError {
    ProtocolError::InvalidPayload { datatype, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(datatype: DataType, value: DatapointValue) {
        let frame = encode(0, 1, datatype, &value).unwrap();
        assert_eq!(decode(&frame).unwrap(), value, "{datatype:?}");
    }

    #[test]
    fn test_roundtrip_representative_values() {
        roundtrip(DataType::Bool, DatapointValue::Bool(true));
        roundtrip(DataType::Bool, DatapointValue::Bool(false));
        roundtrip(DataType::Value, DatapointValue::Value(0));
        roundtrip(DataType::Value, DatapointValue::Value(1));
        roundtrip(DataType::Value, DatapointValue::Value(4_294_967_295));
        roundtrip(DataType::String, DatapointValue::String(String::new()));
        roundtrip(DataType::String, DatapointValue::String("A".to_string()));
        let long: String = (0..255u8).map(char::from).collect();
        roundtrip(DataType::String, DatapointValue::String(long));
        roundtrip(DataType::Enum, DatapointValue::Enum(0));
        roundtrip(DataType::Enum, DatapointValue::Enum(255));
        roundtrip(DataType::Raw, DatapointValue::Raw(Bytes::new()));
        roundtrip(
            DataType::Raw,
            DatapointValue::Raw(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00])),
        );
        roundtrip(DataType::Bitmap, DatapointValue::Bitmap(0x8001));
    }

    #[test]
    fn test_value_is_big_endian() {
        let frame = encode(3, 2, DataType::Value, &DatapointValue::Value(500)).unwrap();
        assert_eq!(frame.data.as_ref(), &[0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(frame.length(), 4);
        assert_eq!(frame.transaction_id, 3);
    }

    #[test]
    fn test_bitmap_width_policy() {
        let narrow = encode(0, 1, DataType::Bitmap, &DatapointValue::Bitmap(0x05)).unwrap();
        assert_eq!(narrow.data.as_ref(), &[0x05]);
        let wide = encode(0, 1, DataType::Bitmap, &DatapointValue::Bitmap(0x0001_0000)).unwrap();
        assert_eq!(wide.data.as_ref(), &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(
            decode_parts(5, &[0x01, 0x02]).unwrap(),
            DatapointValue::Bitmap(0x0102)
        );
    }

    #[test]
    fn test_bool_non_one_is_false() {
        assert_eq!(decode_parts(1, &[0x02]).unwrap(), DatapointValue::Bool(false));
        assert_eq!(decode_parts(1, &[0x01]).unwrap(), DatapointValue::Bool(true));
    }

    #[test]
    fn test_string_decodes_one_char_per_byte() {
        assert_eq!(
            decode_parts(3, &[0x48, 0xE9]).unwrap(),
            DatapointValue::String("H\u{e9}".to_string())
        );
    }

    #[test]
    fn test_invalid_datapoint_id() {
        let result = encode(0, 256, DataType::Bool, &DatapointValue::Bool(true));
        assert_eq!(result, Err(ProtocolError::InvalidDatapointId(256)));
    }

    #[test]
    fn test_mismatched_value_is_invalid_payload() {
        let result = encode(0, 1, DataType::Raw, &DatapointValue::Bool(true));
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidPayload { datatype: DataType::Raw, .. })
        ));
    }

    #[test]
    fn test_wide_codepoint_is_invalid_payload() {
        let result = encode(0, 1, DataType::String, &DatapointValue::String("\u{263A}".into()));
        assert!(matches!(result, Err(ProtocolError::InvalidPayload { .. })));
    }

    #[test]
    fn test_unsupported_datatype() {
        assert_eq!(
            decode_parts(6, &[0x00]),
            Err(ProtocolError::UnsupportedDatatype(6))
        );
    }

    #[test]
    fn test_short_value_rejected() {
        assert!(matches!(
            decode_parts(2, &[0x01, 0x02]),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }
}
