//! Frame delimiting for any [`Protocol`].
//!
//! Decoding is a two-state machine: wait for a full header, then wait for
//! the declared body. A frame is always consumed completely before the next
//! header is looked at, whether it validates or not.

use crate::protocol::{FramingFault, Protocol};
use crate::transaction::Transaction;
use bytes::{Buf, Bytes, BytesMut};
use hmi_common::{LinkError, LinkResult};
use tokio_util::codec::{Decoder, Encoder};

/// A delimited inbound frame.
#[derive(Debug)]
pub enum Inbound<H> {
    /// Frame passed marker validation.
    Frame {
        /// Decoded header.
        header: H,
        /// Payload and trailer.
        body: Bytes,
    },
    /// Frame was skipped because a marker did not match.
    Malformed {
        /// Decoded header.
        header: H,
        /// What failed.
        fault: FramingFault,
    },
}

#[derive(Debug, Clone, Copy)]
enum DecodeState<H> {
    AwaitHeader,
    AwaitBody { header: H, len: usize },
}

/// [`Decoder`]/[`Encoder`] pair driven by a [`Protocol`].
#[derive(Debug)]
pub struct FrameCodec<P: Protocol> {
    protocol: P,
    state: DecodeState<P::Header>,
}

impl<P: Protocol> FrameCodec<P> {
    /// Create a codec waiting for a header.
    #[must_use]
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            state: DecodeState::AwaitHeader,
        }
    }

    /// Returns true if part of a frame has been consumed.
    #[must_use]
    pub fn mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::AwaitBody { .. })
    }
}

impl<P: Protocol> Decoder for FrameCodec<P> {
    type Item = Inbound<P::Header>;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> LinkResult<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::AwaitHeader => {
                    if src.len() < P::HEADER_SIZE {
                        src.reserve(P::HEADER_SIZE - src.len());
                        return Ok(None);
                    }
                    let header = self.protocol.decode_header(&src[..P::HEADER_SIZE])?;
                    let len = self.protocol.body_len(&header)?;
                    src.advance(P::HEADER_SIZE);
                    self.state = DecodeState::AwaitBody { header, len };
                }
                DecodeState::AwaitBody { header, len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    self.state = DecodeState::AwaitHeader;

                    return Ok(Some(match self.protocol.validate(&header, &body) {
                        Ok(()) => Inbound::Frame { header, body },
                        Err(fault) => Inbound::Malformed { header, fault },
                    }));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> LinkResult<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.state {
            DecodeState::AwaitHeader if src.is_empty() => Ok(None),
            DecodeState::AwaitHeader => Err(LinkError::Truncated {
                expected: P::HEADER_SIZE,
                received: src.len(),
            }),
            DecodeState::AwaitBody { len, .. } => Err(LinkError::Truncated {
                expected: len,
                received: src.len(),
            }),
        }
    }
}

impl<P: Protocol> Encoder<&Transaction<P>> for FrameCodec<P> {
    type Error = LinkError;

    fn encode(&mut self, transaction: &Transaction<P>, dst: &mut BytesMut) -> LinkResult<()> {
        self.protocol.encode_frame(
            transaction.id,
            transaction.function_code,
            &transaction.address,
            transaction.payload.as_slice(),
            dst,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{encode_request, MbapHeader, ModbusTcp};

    fn reply(tid: u16, unit: u8, pdu: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        encode_request(&mut dst, tid, unit, pdu[0], &pdu[1..]);
        dst
    }

    #[test]
    fn test_waits_for_full_frame() {
        let mut codec = FrameCodec::new(ModbusTcp::new(1));
        let full = reply(9, 1, &[0x03, 0x02, 0x12, 0x34]);

        let mut src = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(!codec.mid_frame());

        src.extend_from_slice(&full[5..8]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(codec.mid_frame());

        src.extend_from_slice(&full[8..]);
        match codec.decode(&mut src).unwrap() {
            Some(Inbound::Frame { header, body }) => {
                assert_eq!(header.transaction_id, 9);
                assert_eq!(&body[..], &[0x03, 0x02, 0x12, 0x34]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(src.is_empty());
    }

    #[test]
    fn test_malformed_frame_consumes_declared_bytes() {
        let mut codec = FrameCodec::new(ModbusTcp::new(1));
        let mut src = reply(1, 7, &[0x03, 0x02, 0x00, 0x01]);
        src.extend_from_slice(&reply(2, 1, &[0x06, 0x00, 0x01, 0x00, 0x05]));

        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Inbound::Malformed {
                fault: FramingFault::UnitId {
                    expected: 1,
                    received: 7
                },
                ..
            })
        ));
        match codec.decode(&mut src).unwrap() {
            Some(Inbound::Frame { header, .. }) => assert_eq!(header.transaction_id, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_eof_mid_body_is_truncated() {
        let mut codec = FrameCodec::new(ModbusTcp::new(1));
        let full = reply(3, 1, &[0x01, 0x01, 0xB2]);
        let mut src = BytesMut::from(&full[..full.len() - 1]);

        let err = codec.decode_eof(&mut src).unwrap_err();
        assert_eq!(
            err,
            LinkError::Truncated {
                expected: 3,
                received: 2
            }
        );
    }

    #[test]
    fn test_eof_between_frames_is_clean() {
        let mut codec = FrameCodec::new(ModbusTcp::new(1));
        let mut src = BytesMut::new();
        assert!(codec.decode_eof(&mut src).unwrap().is_none());

        let mut partial = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(LinkError::Truncated {
                expected: MbapHeader::SIZE,
                received: 3
            })
        ));
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut codec = FrameCodec::new(ModbusTcp::new(1));
        let mut src = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(LinkError::Framing(_))
        ));
    }
}
