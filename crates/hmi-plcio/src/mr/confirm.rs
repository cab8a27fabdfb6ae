//! Fan-out of MR replies to every registered listener.

use super::frame::{function_code, MrProtocol};
use super::layout::{
    block_span, data_block, SignalLayout, ANALOG_BLOCKS, DIGITAL_BLOCKS, FORAT_QUALITY_BYTES,
};
use crate::protocol::{Dispatch, Reply};
use bytes::Buf;
use hmi_common::{LinkError, SignalBlockConfig};
use std::sync::Arc;
use tracing::{error, warn};

/// Receives signal data read from an MR device.
///
/// Replies are not correlated with requests; every available listener sees
/// every read-all-signal reply. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait MrConfirmation: Send + Sync {
    /// Returning false skips this listener.
    fn available(&self) -> bool {
        true
    }

    /// The whole read-all-signal payload.
    fn on_all_signals(&self, addr0: u16, addrn: u16, data: &[u8]) {}

    /// `REALTIME` block.
    fn on_realtime_data(&self, data: &[f32]) {}

    /// `FORAT` block with its digital quality bytes.
    fn on_forat_data(&self, dqs: &[u8], data: &[f32]) {}

    /// `ANALOG_INPUT` block.
    fn on_analog_input_data(&self, data: &[f32]) {}

    /// `ANALOG_INPUT_RAW` block.
    fn on_raw_analog_input_data(&self, data: &[f32]) {}

    /// `ANALOG_OUTPUT` block.
    fn on_analog_output_data(&self, data: &[f32]) {}

    /// `ANALOG_OUTPUT_RAW` block.
    fn on_raw_analog_output_data(&self, data: &[f32]) {}

    /// `DIGITAL_INPUT` block.
    fn on_digital_input(&self, data: &[u8]) {}

    /// `DIGITAL_INPUT_RAW` block.
    fn on_raw_digital_input(&self, data: &[u8]) {}

    /// `DIGITAL_OUTPUT_RAW` block.
    fn on_raw_digital_output(&self, data: &[u8]) {}
}

/// Deliver a reply to all available listeners.
pub(crate) fn dispatch(
    layout: &SignalLayout,
    reply: &Reply<'_, MrProtocol>,
    listeners: &[Arc<dyn MrConfirmation>],
) -> Dispatch {
    let header = reply.header;
    let Some(payload) = reply.body.get(..usize::from(header.size)) else {
        return Dispatch::Undecodable(LinkError::Insufficient {
            needed: usize::from(header.size),
            available: reply.body.len(),
        });
    };

    if header.function_code != function_code::READ_SIGNAL || header.db != data_block::FOR_ALL {
        return Dispatch::Ignored;
    }

    let listeners: Vec<&dyn MrConfirmation> = listeners
        .iter()
        .map(|listener| &**listener)
        .filter(|listener| listener.available())
        .collect();
    if listeners.is_empty() {
        return Dispatch::Ignored;
    }

    for listener in &listeners {
        listener.on_all_signals(header.addr0, header.addrn, payload);
    }
    split_signals(layout, payload, &listeners);
    Dispatch::Confirmed { unconsumed: 0 }
}

/// Cut the all-signals payload into blocks and call the per-block methods.
fn split_signals(layout: &SignalLayout, payload: &[u8], listeners: &[&dyn MrConfirmation]) {
    for db in ANALOG_BLOCKS {
        let Some(block) = locate(layout, db, payload.len()) else {
            continue;
        };
        let start = usize::from(block.addr0);
        let bytes = &payload[start..start + block_span(db, block.count)];
        let quality = if db == data_block::FORAT {
            FORAT_QUALITY_BYTES
        } else {
            0
        };
        let (dqs, mut raw) = bytes.split_at(quality);

        let values: Vec<f32> = (0..block.count).map(|_| raw.get_f32()).collect();
        for listener in listeners {
            match db {
                data_block::REALTIME => listener.on_realtime_data(&values),
                data_block::FORAT => listener.on_forat_data(dqs, &values),
                data_block::ANALOG_INPUT => listener.on_analog_input_data(&values),
                data_block::ANALOG_INPUT_RAW => listener.on_raw_analog_input_data(&values),
                data_block::ANALOG_OUTPUT => listener.on_analog_output_data(&values),
                _ => listener.on_raw_analog_output_data(&values),
            }
        }
    }

    for db in DIGITAL_BLOCKS {
        let Some(block) = locate(layout, db, payload.len()) else {
            continue;
        };
        let start = usize::from(block.addr0);
        let data = &payload[start..start + block_span(db, block.count)];
        for listener in listeners {
            match db {
                data_block::DIGITAL_INPUT => listener.on_digital_input(data),
                data_block::DIGITAL_INPUT_RAW => listener.on_raw_digital_input(data),
                _ => listener.on_raw_digital_output(data),
            }
        }
    }
}

/// Configured placement of `db`, if it fits inside `total` payload bytes.
fn locate(layout: &SignalLayout, db: u16, total: usize) -> Option<SignalBlockConfig> {
    let Some(block) = layout.block(db).copied() else {
        warn!(db, "missing configuration for data block");
        return None;
    };

    let span = block_span(db, block.count);
    let declared = usize::from(block.addrn.wrapping_sub(block.addr0)) + 1;
    if block.addrn < block.addr0 || declared != span {
        warn!(
            db,
            addr0 = block.addr0,
            addrn = block.addrn,
            count = block.count,
            span,
            "address range of data block does not match its count"
        );
    }

    if usize::from(block.addr0) + span > total {
        error!(
            db,
            addr0 = block.addr0,
            span,
            total,
            "data block exceeds the received payload, skipped"
        );
        return None;
    }
    Some(block)
}
