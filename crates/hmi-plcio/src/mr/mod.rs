//! MR master protocol.
//!
//! MR frames carry a data block and an address range instead of a
//! transaction id. Replies are fanned out to every registered
//! [`MrConfirmation`]; a read-all-signal reply is additionally split into
//! its data blocks according to the configured [`SignalLayout`].

mod confirm;
mod frame;
mod layout;
mod master;

pub use confirm::MrConfirmation;
pub use frame::{
    checksum, decode_trailer, function_code, MrAddress, MrHeader, MrProtocol, MrRequest,
    MrTrailer, DEFAULT_END_MARKER, DEFAULT_LEADING_MARKER, MAX_PAYLOAD,
};
pub use layout::{block_span, data_block, SignalLayout, ANALOG_BLOCKS, DIGITAL_BLOCKS, FORAT_QUALITY_BYTES};
pub use master::MrMaster;
