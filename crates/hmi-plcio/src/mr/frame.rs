//! MR framing: 10-byte header, payload, 4-byte trailer.

use super::confirm::{self, MrConfirmation};
use super::layout::SignalLayout;
use crate::pdu::PduBuffer;
use crate::protocol::{Dispatch, FramingFault, Protocol, Reply};
use bytes::{Buf, BufMut, BytesMut};
use hmi_common::{LinkError, LinkResult, MrConfig};
use std::sync::Arc;

/// Default leading marker (`$`).
pub const DEFAULT_LEADING_MARKER: u8 = 0x24;
/// Default end-of-message marker (`\r\n`).
pub const DEFAULT_END_MARKER: u16 = 0x0D0A;
/// Largest request payload.
pub const MAX_PAYLOAD: usize = 1024;

/// MR function codes.
pub mod function_code {
    /// Read signal (`'R'`).
    pub const READ_SIGNAL: u8 = b'R';
    /// Write analog quantity (`'A'`).
    pub const WRITE_ANALOG: u8 = b'A';
    /// Write digital quantity (`'D'`).
    pub const WRITE_DIGITAL: u8 = b'D';
}

/// MR frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHeader {
    /// Leading marker byte.
    pub leading: u8,
    /// Function code.
    pub function_code: u8,
    /// Data block.
    pub db: u16,
    /// First address.
    pub addr0: u16,
    /// Last address (inclusive).
    pub addrn: u16,
    /// Payload length.
    pub size: u16,
}

impl MrHeader {
    /// Header size on the wire.
    pub const SIZE: usize = 10;

    /// Decode a header from the start of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if fewer than 10 bytes are given.
    pub fn decode(mut src: &[u8]) -> LinkResult<Self> {
        if src.len() < Self::SIZE {
            return Err(LinkError::Insufficient {
                needed: Self::SIZE,
                available: src.len(),
            });
        }
        Ok(Self {
            leading: src.get_u8(),
            function_code: src.get_u8(),
            db: src.get_u16(),
            addr0: src.get_u16(),
            addrn: src.get_u16(),
            size: src.get_u16(),
        })
    }

    /// Append the header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.leading);
        dst.put_u8(self.function_code);
        dst.put_u16(self.db);
        dst.put_u16(self.addr0);
        dst.put_u16(self.addrn);
        dst.put_u16(self.size);
    }
}

/// MR frame trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrTrailer {
    /// Wrapping sum of the payload bytes.
    pub checksum: u16,
    /// End-of-message marker.
    pub end_marker: u16,
}

impl MrTrailer {
    /// Trailer size on the wire.
    pub const SIZE: usize = 4;
}

/// Decode the trailer from exactly its last four bytes of `body`.
///
/// # Errors
///
/// Returns [`LinkError::Insufficient`] if `body` is shorter than a trailer.
pub fn decode_trailer(body: &[u8]) -> LinkResult<MrTrailer> {
    let Some(start) = body.len().checked_sub(MrTrailer::SIZE) else {
        return Err(LinkError::Insufficient {
            needed: MrTrailer::SIZE,
            available: body.len(),
        });
    };
    let mut tail = &body[start..];
    Ok(MrTrailer {
        checksum: tail.get_u16(),
        end_marker: tail.get_u16(),
    })
}

/// Wrapping 16-bit sum of `payload`.
#[must_use]
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)))
}

/// Data block and address range of an MR request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrAddress {
    /// Data block.
    pub db: u16,
    /// First address.
    pub addr0: u16,
    /// Last address (inclusive).
    pub addrn: u16,
}

/// An MR request.
#[derive(Debug, Clone, PartialEq)]
pub enum MrRequest {
    /// Read signals; the device replies with the block contents.
    ReadSignal {
        /// Block and range to read.
        address: MrAddress,
        /// Tidemark forwarded to the device.
        tidemark: f32,
    },
    /// Write analog quantities.
    WriteAnalog {
        /// Block and range to write.
        address: MrAddress,
        /// Values, big-endian `f32` on the wire.
        values: Vec<f32>,
    },
    /// Write digital quantities.
    WriteDigital {
        /// Block and range to write.
        address: MrAddress,
        /// Raw bytes.
        values: Vec<u8>,
    },
}

impl MrRequest {
    /// Function code of the request.
    #[must_use]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadSignal { .. } => function_code::READ_SIGNAL,
            Self::WriteAnalog { .. } => function_code::WRITE_ANALOG,
            Self::WriteDigital { .. } => function_code::WRITE_DIGITAL,
        }
    }

    /// Block and range of the request.
    #[must_use]
    pub fn address(&self) -> MrAddress {
        match self {
            Self::ReadSignal { address, .. }
            | Self::WriteAnalog { address, .. }
            | Self::WriteDigital { address, .. } => *address,
        }
    }

    /// Reject inverted ranges, empty writes and oversized payloads.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] describing the problem.
    pub fn validate(&self) -> LinkResult<()> {
        let address = self.address();
        if address.addrn < address.addr0 {
            return Err(LinkError::InvalidRequest(format!(
                "address range [{}, {}] of DB{} is inverted",
                address.addr0, address.addrn, address.db
            )));
        }

        let payload = match self {
            Self::ReadSignal { .. } => 4,
            Self::WriteAnalog { values, .. } => values.len() * 4,
            Self::WriteDigital { values, .. } => values.len(),
        };
        if payload == 0 || payload > MAX_PAYLOAD {
            return Err(LinkError::InvalidRequest(format!(
                "payload of {payload} bytes for DB{} is outside 1..={MAX_PAYLOAD}",
                address.db
            )));
        }
        Ok(())
    }

    /// Encode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the buffer is too small.
    pub fn encode(&self, buf: &mut PduBuffer) -> LinkResult<()> {
        match self {
            Self::ReadSignal { tidemark, .. } => buf.put_f32(*tidemark),
            Self::WriteAnalog { values, .. } => {
                for value in values {
                    buf.put_f32(*value)?;
                }
                Ok(())
            }
            Self::WriteDigital { values, .. } => buf.put_slice(values),
        }
    }
}

/// MR framing with configurable markers and the signal layout used to
/// split read-all-signal replies.
#[derive(Debug, Clone)]
pub struct MrProtocol {
    leading_marker: u8,
    end_marker: u16,
    verify_checksum: bool,
    layout: Arc<SignalLayout>,
}

impl Default for MrProtocol {
    fn default() -> Self {
        Self::new(SignalLayout::default())
    }
}

impl MrProtocol {
    /// Default markers, checksum not verified.
    #[must_use]
    pub fn new(layout: SignalLayout) -> Self {
        Self {
            leading_marker: DEFAULT_LEADING_MARKER,
            end_marker: DEFAULT_END_MARKER,
            verify_checksum: false,
            layout: Arc::new(layout),
        }
    }

    /// Markers, checksum policy and layout from the `[mr]` section.
    #[must_use]
    pub fn from_config(config: &MrConfig) -> Self {
        Self {
            leading_marker: config.leading_marker,
            end_marker: config.end_marker,
            verify_checksum: config.verify_checksum,
            layout: Arc::new(SignalLayout::new(&config.blocks)),
        }
    }

    /// Reject replies whose checksum does not match.
    #[must_use]
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Use different markers.
    #[must_use]
    pub fn with_markers(mut self, leading: u8, end: u16) -> Self {
        self.leading_marker = leading;
        self.end_marker = end;
        self
    }

    /// Layout used to split read-all-signal replies.
    #[must_use]
    pub fn layout(&self) -> &SignalLayout {
        &self.layout
    }
}

impl Protocol for MrProtocol {
    type Header = MrHeader;
    type Request = MrRequest;
    type Address = MrAddress;
    type Confirmation = dyn MrConfirmation;

    const NAME: &'static str = "mr";
    const HEADER_SIZE: usize = MrHeader::SIZE;
    const MAX_PDU_SIZE: usize = MAX_PAYLOAD;
    const CORRELATED: bool = false;

    fn function_code(request: &MrRequest) -> u8 {
        request.function_code()
    }

    fn address(&self, request: &MrRequest) -> MrAddress {
        request.address()
    }

    fn validate_request(request: &MrRequest) -> LinkResult<()> {
        request.validate()
    }

    fn encode_payload(request: &MrRequest, buffer: &mut PduBuffer) -> LinkResult<()> {
        request.encode(buffer)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_frame(
        &self,
        _transaction_id: u16,
        function_code: u8,
        address: &MrAddress,
        payload: &[u8],
        dst: &mut BytesMut,
    ) {
        dst.reserve(MrHeader::SIZE + payload.len() + MrTrailer::SIZE);
        MrHeader {
            leading: self.leading_marker,
            function_code,
            db: address.db,
            addr0: address.addr0,
            addrn: address.addrn,
            size: payload.len() as u16,
        }
        .encode(dst);
        dst.put_slice(payload);
        dst.put_u16(checksum(payload));
        dst.put_u16(self.end_marker);
    }

    fn decode_header(&self, src: &[u8]) -> LinkResult<MrHeader> {
        MrHeader::decode(src)
    }

    fn body_len(&self, header: &MrHeader) -> LinkResult<usize> {
        Ok(usize::from(header.size) + MrTrailer::SIZE)
    }

    fn validate(&self, header: &MrHeader, body: &[u8]) -> Result<(), FramingFault> {
        if header.leading != self.leading_marker {
            return Err(FramingFault::LeadingMarker {
                expected: self.leading_marker,
                received: header.leading,
            });
        }

        let trailer = decode_trailer(body).map_err(|_| FramingFault::EndMarker {
            expected: self.end_marker,
            received: 0,
        })?;
        if trailer.end_marker != self.end_marker {
            return Err(FramingFault::EndMarker {
                expected: self.end_marker,
                received: trailer.end_marker,
            });
        }

        if self.verify_checksum {
            let computed = checksum(&body[..body.len() - MrTrailer::SIZE]);
            if computed != trailer.checksum {
                return Err(FramingFault::Checksum {
                    received: trailer.checksum,
                    computed,
                });
            }
        }
        Ok(())
    }

    fn transaction_id(_header: &MrHeader) -> Option<u16> {
        None
    }

    fn confirm(&self, reply: Reply<'_, Self>, listeners: &[Arc<dyn MrConfirmation>]) -> Dispatch {
        confirm::dispatch(&self.layout, &reply, listeners)
    }
}
