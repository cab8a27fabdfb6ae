//! The seam between the transaction engine and a wire protocol.
//!
//! The engine knows nothing about Modbus or MR. It frames the byte stream
//! with [`Protocol::decode_header`] and [`Protocol::body_len`], correlates
//! replies through [`Protocol::transaction_id`] and hands every reply to
//! [`Protocol::confirm`] for decoding and listener dispatch.

use crate::pdu::PduBuffer;
use crate::transaction::Transaction;
use bytes::BytesMut;
use hmi_common::{LinkError, LinkResult, TransactionFailure};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// A length-delimited header + payload (+ trailer) protocol.
pub trait Protocol: Clone + Send + Sync + 'static {
    /// Decoded frame header.
    type Header: Copy + Debug + Send;
    /// Typed request accepted by the client.
    type Request: Debug + Send;
    /// Per-request addressing carried in the frame header (unit for Modbus).
    type Address: Copy + Debug + Send + Sync;
    /// Listener object receiving decoded replies.
    type Confirmation: ?Sized + Send + Sync + 'static;

    /// Short protocol name for logs.
    const NAME: &'static str;
    /// Fixed header length in bytes.
    const HEADER_SIZE: usize;
    /// Capacity of a request payload buffer.
    const MAX_PDU_SIZE: usize;
    /// Replies echo the request's transaction id.
    ///
    /// Uncorrelated protocols never hold transactions in flight; every reply
    /// is fanned out to the registered listeners.
    const CORRELATED: bool;

    /// Function code written for `request`.
    fn function_code(request: &Self::Request) -> u8;

    /// Header addressing for `request`.
    fn address(&self, request: &Self::Request) -> Self::Address;

    /// Reject requests that cannot be encoded. Nothing is queued on error.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] describing the violated limit.
    fn validate_request(request: &Self::Request) -> LinkResult<()> {
        let _ = request;
        Ok(())
    }

    /// Encode the request payload (everything after the function code).
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the payload exceeds the buffer.
    fn encode_payload(request: &Self::Request, buffer: &mut PduBuffer) -> LinkResult<()>;

    /// Write one complete request frame.
    fn encode_frame(
        &self,
        transaction_id: u16,
        function_code: u8,
        address: &Self::Address,
        payload: &[u8],
        dst: &mut BytesMut,
    );

    /// Parse a header from exactly [`HEADER_SIZE`](Self::HEADER_SIZE) bytes.
    ///
    /// # Errors
    ///
    /// Fails only with [`LinkError::Insufficient`].
    fn decode_header(&self, src: &[u8]) -> LinkResult<Self::Header>;

    /// Bytes that follow the header (payload and trailer).
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Framing`] if the declared length cannot be
    /// honoured; the stream is then out of step and must be dropped.
    fn body_len(&self, header: &Self::Header) -> LinkResult<usize>;

    /// Check markers once the whole frame is buffered.
    ///
    /// # Errors
    ///
    /// A [`FramingFault`] discards this frame only.
    fn validate(&self, header: &Self::Header, body: &[u8]) -> Result<(), FramingFault>;

    /// Transaction id of a reply, `None` for uncorrelated protocols.
    fn transaction_id(header: &Self::Header) -> Option<u16>;

    /// Decode a reply and call the matching listener callback(s).
    fn confirm(&self, reply: Reply<'_, Self>, listeners: &[Arc<Self::Confirmation>]) -> Dispatch;

    /// Tell a transaction's confirmation it was retired without a reply.
    fn fail(&self, transaction: &Transaction<Self>, failure: TransactionFailure) {
        let _ = (transaction, failure);
    }
}

/// A complete inbound frame ready for dispatch.
pub struct Reply<'a, P: Protocol> {
    /// Decoded header.
    pub header: P::Header,
    /// Everything after the header.
    pub body: &'a [u8],
    /// The retired transaction the reply answers (correlated protocols).
    pub transaction: Option<&'a Transaction<P>>,
}

/// Outcome of [`Protocol::confirm`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A positive reply was decoded and delivered.
    Confirmed {
        /// Body bytes the decoder did not use.
        unconsumed: usize,
    },
    /// The device rejected the request.
    Exception {
        /// Function code of the original request.
        function_code: u8,
        /// Protocol specific reason byte.
        reason: u8,
    },
    /// The reply answers a different function than the request.
    FunctionMismatch {
        /// Function code of the original request.
        expected: u8,
        /// Function code found in the reply.
        received: u8,
    },
    /// The reply was too short for its function code.
    Undecodable(LinkError),
    /// Nothing listens for this kind of reply.
    Ignored,
}

/// A frame that was delimited correctly but fails validation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingFault {
    /// Modbus protocol identifier is not zero.
    #[error("protocol identifier {0} is not Modbus")]
    ProtocolId(u16),

    /// Reply is addressed to another unit.
    #[error("unit identifier mismatch: expected {expected}, received {received}")]
    UnitId {
        /// Configured unit.
        expected: u8,
        /// Unit in the reply.
        received: u8,
    },

    /// Frame does not start with the leading marker.
    #[error("leading marker mismatch: expected {expected:#04x}, received {received:#04x}")]
    LeadingMarker {
        /// Configured marker.
        expected: u8,
        /// Marker in the frame.
        received: u8,
    },

    /// Frame does not end with the end-of-message marker.
    #[error("end marker mismatch: expected {expected:#06x}, received {received:#06x}")]
    EndMarker {
        /// Configured marker.
        expected: u16,
        /// Marker in the trailer.
        received: u16,
    },

    /// Trailer checksum does not match the payload.
    #[error("checksum mismatch: trailer {received:#06x}, computed {computed:#06x}")]
    Checksum {
        /// Checksum in the trailer.
        received: u16,
        /// Checksum of the received payload.
        computed: u16,
    },
}
