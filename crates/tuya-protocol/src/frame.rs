//! Datapoint frame structure

use crate::types::{DataType, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size: status(1) + transid(1) + dp(1) + datatype(1) + length(2) = 6
pub const HEADER_SIZE: usize = 6;

/// Datapoint frame as carried on the Tuya cluster
///
/// Frame format:
/// ```text
/// [Status: 1 byte]
/// [Transaction ID: 1 byte] (wraps at 256)
/// [Datapoint: 1 byte]
/// [Datatype: 1 byte] (raw=0, bool=1, value=2, string=3, enum=4, bitmap=5)
/// [Length: 2 bytes BE]
/// [Data: variable]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: u8,
    pub transaction_id: u8,
    pub dp: u8,
    pub datatype: DataType,
    pub data: Bytes,
}

impl Frame {
    /// Create a new outbound frame (status=0)
    #[must_use]
    pub fn new(transaction_id: u8, dp: u8, datatype: DataType, data: Bytes) -> Self {
        Self {
            status: 0,
            transaction_id,
            dp,
            datatype,
            data,
        }
    }

    /// Length field as written on the wire
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Codec refuses payloads above u16::MAX
    pub fn length(&self) -> u16 {
        self.data.len() as u16
    }

    /// Serialize frame to bytes
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        buf.put_u8(self.status);
        buf.put_u8(self.transaction_id);
        buf.put_u8(self.dp);
        buf.put_u8(self.datatype as u8);
        buf.put_u16(self.length());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Deserialize frame from bytes
    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize(mut data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }

        let status = data.get_u8();
        let transaction_id = data.get_u8();
        let dp = data.get_u8();
        let datatype = DataType::try_from(data.get_u8())?;
        let length = data.get_u16() as usize;

        if length != data.remaining() {
            return Err(ProtocolError::InvalidFrame(format!(
                "Length mismatch: header says {}, actual {}",
                length,
                data.remaining()
            )));
        }

        Ok(Self {
            status,
            transaction_id,
            dp,
            datatype,
            data: Bytes::copy_from_slice(data),
        })
    }
}
