//! MBAP framing and the [`Protocol`] implementation for Modbus TCP.

use super::confirm::{self, ModbusConfirmation};
use super::request::ModbusRequest;
use crate::pdu::PduBuffer;
use crate::protocol::{Dispatch, FramingFault, Protocol, Reply};
use crate::transaction::Transaction;
use bytes::{Buf, BufMut, BytesMut};
use hmi_common::{LinkError, LinkResult, TransactionFailure};
use std::sync::Arc;

/// Modbus TCP protocol identifier.
const MODBUS_PROTOCOL_ID: u16 = 0x0000;

/// Largest PDU data after the function code (253 byte PDU).
pub const MAX_PDU_DATA: usize = 252;

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier echoed by the server.
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    pub protocol_id: u16,
    /// Number of following bytes (unit identifier + PDU).
    pub length: u16,
    /// Unit identifier.
    pub unit_id: u8,
}

impl MbapHeader {
    /// Header size on the wire.
    pub const SIZE: usize = 7;

    /// Decode a header from the start of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if fewer than 7 bytes are given.
    pub fn decode(mut src: &[u8]) -> LinkResult<Self> {
        if src.len() < Self::SIZE {
            return Err(LinkError::Insufficient {
                needed: Self::SIZE,
                available: src.len(),
            });
        }
        Ok(Self {
            transaction_id: src.get_u16(),
            protocol_id: src.get_u16(),
            length: src.get_u16(),
            unit_id: src.get_u8(),
        })
    }

    /// PDU length (function code included) declared by the header.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Framing`] if the length cannot hold a function
    /// code or exceeds the largest Modbus PDU.
    pub fn pdu_len(&self) -> LinkResult<usize> {
        let length = usize::from(self.length);
        if !(2..=MAX_PDU_DATA + 2).contains(&length) {
            return Err(LinkError::Framing(format!(
                "MBAP length {length} outside 2..={}",
                MAX_PDU_DATA + 2
            )));
        }
        Ok(length - 1)
    }
}

/// Write an MBAP frame: header, function code, then `payload`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_request(
    dst: &mut BytesMut,
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    payload: &[u8],
) {
    dst.reserve(MbapHeader::SIZE + 1 + payload.len());
    dst.put_u16(transaction_id);
    dst.put_u16(MODBUS_PROTOCOL_ID);
    // Length = unit ID (1) + function code (1) + data
    dst.put_u16((payload.len() + 2) as u16);
    dst.put_u8(unit_id);
    dst.put_u8(function_code);
    dst.put_slice(payload);
}

/// Modbus TCP framing bound to one unit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusTcp {
    unit_id: u8,
}

impl Default for ModbusTcp {
    fn default() -> Self {
        Self::new(0xFF)
    }
}

impl ModbusTcp {
    /// Frame requests for `unit_id` and accept only replies from it.
    #[must_use]
    pub fn new(unit_id: u8) -> Self {
        Self { unit_id }
    }

    /// Configured unit identifier.
    #[must_use]
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }
}

impl Protocol for ModbusTcp {
    type Header = MbapHeader;
    type Request = ModbusRequest;
    type Address = u8;
    type Confirmation = dyn ModbusConfirmation;

    const NAME: &'static str = "modbus-tcp";
    const HEADER_SIZE: usize = MbapHeader::SIZE;
    const MAX_PDU_SIZE: usize = MAX_PDU_DATA;
    const CORRELATED: bool = true;

    fn function_code(request: &ModbusRequest) -> u8 {
        request.function_code() as u8
    }

    fn address(&self, _request: &ModbusRequest) -> u8 {
        self.unit_id
    }

    fn validate_request(request: &ModbusRequest) -> LinkResult<()> {
        request.validate()
    }

    fn encode_payload(request: &ModbusRequest, buffer: &mut PduBuffer) -> LinkResult<()> {
        request.encode(buffer)
    }

    fn encode_frame(
        &self,
        transaction_id: u16,
        function_code: u8,
        address: &u8,
        payload: &[u8],
        dst: &mut BytesMut,
    ) {
        encode_request(dst, transaction_id, *address, function_code, payload);
    }

    fn decode_header(&self, src: &[u8]) -> LinkResult<MbapHeader> {
        MbapHeader::decode(src)
    }

    fn body_len(&self, header: &MbapHeader) -> LinkResult<usize> {
        header.pdu_len()
    }

    fn validate(&self, header: &MbapHeader, _body: &[u8]) -> Result<(), FramingFault> {
        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FramingFault::ProtocolId(header.protocol_id));
        }
        if header.unit_id != self.unit_id {
            return Err(FramingFault::UnitId {
                expected: self.unit_id,
                received: header.unit_id,
            });
        }
        Ok(())
    }

    fn transaction_id(header: &MbapHeader) -> Option<u16> {
        Some(header.transaction_id)
    }

    fn confirm(
        &self,
        reply: Reply<'_, Self>,
        _listeners: &[Arc<dyn ModbusConfirmation>],
    ) -> Dispatch {
        confirm::dispatch(reply)
    }

    fn fail(&self, transaction: &Transaction<Self>, failure: TransactionFailure) {
        if let Some(confirmation) = &transaction.confirmation {
            confirmation.on_failure(transaction.id, transaction.function_code, failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_encoding() {
        let mut dst = BytesMut::new();
        encode_request(&mut dst, 0x1234, 0xFF, 0x03, &[0x00, 0x00, 0x00, 0x0A]);

        assert_eq!(
            &dst[..],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_mbap_header_decode() {
        let header = MbapHeader::decode(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x05, 0x01]).unwrap();
        assert_eq!(header.transaction_id, 42);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 5);
        assert_eq!(header.unit_id, 1);
        assert_eq!(header.pdu_len().unwrap(), 4);

        assert!(matches!(
            MbapHeader::decode(&[0x00, 0x01]),
            Err(LinkError::Insufficient {
                needed: 7,
                available: 2
            })
        ));
    }

    #[test]
    fn test_length_bounds() {
        let mut header = MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length: 1,
            unit_id: 1,
        };
        assert!(matches!(header.pdu_len(), Err(LinkError::Framing(_))));
        header.length = 254;
        assert_eq!(header.pdu_len().unwrap(), 253);
        header.length = 255;
        assert!(header.pdu_len().is_err());
    }

    #[test]
    fn test_validate_protocol_and_unit() {
        let modbus = ModbusTcp::new(3);
        let mut header = MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length: 3,
            unit_id: 3,
        };
        assert!(modbus.validate(&header, &[0x06]).is_ok());

        header.protocol_id = 1;
        assert_eq!(
            modbus.validate(&header, &[0x06]),
            Err(FramingFault::ProtocolId(1))
        );

        header.protocol_id = 0;
        header.unit_id = 4;
        assert_eq!(
            modbus.validate(&header, &[0x06]),
            Err(FramingFault::UnitId {
                expected: 3,
                received: 4
            })
        );
    }

    #[test]
    fn test_default_unit_is_broadcast_ff() {
        assert_eq!(ModbusTcp::default().unit_id(), 0xFF);
    }
}
