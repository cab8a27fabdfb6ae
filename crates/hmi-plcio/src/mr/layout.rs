//! Data block identifiers and the signal layout of a read-all-signal reply.

use hmi_common::SignalBlockConfig;
use std::collections::HashMap;

/// Data block identifiers.
pub mod data_block {
    /// All signals in one reply.
    pub const FOR_ALL: u16 = 1;
    /// Realtime analog values.
    pub const REALTIME: u16 = 2;
    /// Analog inputs (engineering units).
    pub const ANALOG_INPUT: u16 = 3;
    /// Digital inputs.
    pub const DIGITAL_INPUT: u16 = 4;
    /// Analog outputs (engineering units).
    pub const ANALOG_OUTPUT: u16 = 5;
    /// Digital outputs, raw.
    pub const DIGITAL_OUTPUT_RAW: u16 = 6;
    /// Analog values prefixed with digital quality bytes.
    pub const FORAT: u16 = 20;
    /// Analog inputs, raw.
    pub const ANALOG_INPUT_RAW: u16 = 203;
    /// Analog outputs, raw.
    pub const ANALOG_OUTPUT_RAW: u16 = 204;
    /// Digital inputs, raw.
    pub const DIGITAL_INPUT_RAW: u16 = 205;
}

/// Analog blocks in the order they are dispatched.
pub const ANALOG_BLOCKS: [u16; 6] = [
    data_block::ANALOG_INPUT,
    data_block::ANALOG_INPUT_RAW,
    data_block::ANALOG_OUTPUT,
    data_block::ANALOG_OUTPUT_RAW,
    data_block::FORAT,
    data_block::REALTIME,
];

/// Digital blocks in the order they are dispatched.
pub const DIGITAL_BLOCKS: [u16; 3] = [
    data_block::DIGITAL_INPUT,
    data_block::DIGITAL_OUTPUT_RAW,
    data_block::DIGITAL_INPUT_RAW,
];

/// Digital quality bytes leading the `FORAT` block.
pub const FORAT_QUALITY_BYTES: usize = 2;

/// Where each data block sits inside the all-signals payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalLayout {
    blocks: HashMap<u16, SignalBlockConfig>,
}

impl SignalLayout {
    /// Build from configured blocks. A later entry for the same block wins.
    #[must_use]
    pub fn new(blocks: &[SignalBlockConfig]) -> Self {
        Self {
            blocks: blocks.iter().map(|block| (block.db, *block)).collect(),
        }
    }

    /// Placement of `db`, if configured.
    #[must_use]
    pub fn block(&self, db: u16) -> Option<&SignalBlockConfig> {
        self.blocks.get(&db)
    }

    /// Number of configured blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if no block is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Bytes one block occupies in the payload.
#[must_use]
pub fn block_span(db: u16, count: u16) -> usize {
    let count = usize::from(count);
    if db == data_block::FORAT {
        FORAT_QUALITY_BYTES + count * 4
    } else if ANALOG_BLOCKS.contains(&db) {
        count * 4
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_spans() {
        assert_eq!(block_span(data_block::ANALOG_INPUT, 3), 12);
        assert_eq!(block_span(data_block::FORAT, 3), 14);
        assert_eq!(block_span(data_block::DIGITAL_INPUT, 3), 3);
    }

    #[test]
    fn test_layout_lookup() {
        let layout = SignalLayout::new(&[
            SignalBlockConfig {
                db: data_block::REALTIME,
                count: 2,
                addr0: 0,
                addrn: 7,
            },
            SignalBlockConfig {
                db: data_block::REALTIME,
                count: 1,
                addr0: 8,
                addrn: 11,
            },
        ]);
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.block(data_block::REALTIME).unwrap().addr0, 8);
        assert!(layout.block(data_block::FORAT).is_none());
    }
}
