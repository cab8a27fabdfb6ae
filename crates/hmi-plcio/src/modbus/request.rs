//! Modbus function codes, exception codes and typed requests.

use crate::pdu::PduBuffer;
use hmi_common::{LinkError, LinkResult};

/// Largest quantity of bits one read may request.
pub const MAX_READ_BITS: u16 = 2000;
/// Largest quantity of registers one read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest quantity of coils one write may carry.
pub const MAX_WRITE_COILS: u16 = 1968;
/// Largest quantity of registers one write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01).
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02).
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04).
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05).
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F).
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
    /// Mask Write Register (0x16).
    MaskWriteRegister = 0x16,
}

impl FunctionCode {
    /// Parse a function code from a byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x16 => Some(Self::MaskWriteRegister),
            _ => None,
        }
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
    /// Server device failure.
    ServerDeviceFailure = 0x04,
    /// Acknowledge (request accepted, processing).
    Acknowledge = 0x05,
    /// Server device busy.
    ServerDeviceBusy = 0x06,
    /// Gateway path unavailable.
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond.
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse an exception code from a reason byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetFailed => write!(f, "Gateway Target Failed"),
        }
    }
}

/// A Modbus request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    /// Read `quantity` coils starting at `address`.
    ReadCoils {
        /// First coil.
        address: u16,
        /// Number of coils, 1..=2000.
        quantity: u16,
    },
    /// Read `quantity` discrete inputs starting at `address`.
    ReadDiscreteInputs {
        /// First input.
        address: u16,
        /// Number of inputs, 1..=2000.
        quantity: u16,
    },
    /// Read `quantity` holding registers starting at `address`.
    ReadHoldingRegisters {
        /// First register.
        address: u16,
        /// Number of registers, 1..=125.
        quantity: u16,
    },
    /// Read `quantity` input registers starting at `address`.
    ReadInputRegisters {
        /// First register.
        address: u16,
        /// Number of registers, 1..=125.
        quantity: u16,
    },
    /// Force one coil ON or OFF.
    WriteSingleCoil {
        /// Coil to force.
        address: u16,
        /// ON is sent as `0xFF00`, OFF as `0x0000`.
        value: bool,
    },
    /// Write one holding register.
    WriteSingleRegister {
        /// Register to write.
        address: u16,
        /// New value.
        value: u16,
    },
    /// Force a run of coils.
    WriteMultipleCoils {
        /// First coil.
        address: u16,
        /// Coil states, packed LSB first on the wire.
        values: Vec<bool>,
    },
    /// Write a run of holding registers.
    WriteMultipleRegisters {
        /// First register.
        address: u16,
        /// Register values.
        values: Vec<u16>,
    },
    /// `register = (register & and_mask) | (or_mask & !and_mask)`.
    MaskWriteRegister {
        /// Register to modify.
        address: u16,
        /// Bits kept from the current value.
        and_mask: u16,
        /// Bits set where `and_mask` is clear.
        or_mask: u16,
    },
}

impl ModbusRequest {
    /// Function code of the request.
    #[must_use]
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::MaskWriteRegister { .. } => FunctionCode::MaskWriteRegister,
        }
    }

    /// Check protocol quantity limits.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] for zero or oversized quantities.
    pub fn validate(&self) -> LinkResult<()> {
        let (what, quantity, max) = match self {
            Self::ReadCoils { quantity, .. } => ("coils", usize::from(*quantity), MAX_READ_BITS),
            Self::ReadDiscreteInputs { quantity, .. } => {
                ("discrete inputs", usize::from(*quantity), MAX_READ_BITS)
            }
            Self::ReadHoldingRegisters { quantity, .. } | Self::ReadInputRegisters { quantity, .. } => {
                ("registers", usize::from(*quantity), MAX_READ_REGISTERS)
            }
            Self::WriteMultipleCoils { values, .. } => ("coils", values.len(), MAX_WRITE_COILS),
            Self::WriteMultipleRegisters { values, .. } => {
                ("registers", values.len(), MAX_WRITE_REGISTERS)
            }
            Self::WriteSingleCoil { .. }
            | Self::WriteSingleRegister { .. }
            | Self::MaskWriteRegister { .. } => return Ok(()),
        };

        if quantity == 0 || quantity > usize::from(max) {
            return Err(LinkError::InvalidRequest(format!(
                "{:?} of {quantity} {what} is outside 1..={max}",
                self.function_code()
            )));
        }
        Ok(())
    }

    /// Encode the PDU data following the function code.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the buffer is too small.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, buf: &mut PduBuffer) -> LinkResult<()> {
        match self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                buf.put_u16(*address)?;
                buf.put_u16(*quantity)
            }
            Self::WriteSingleCoil { address, value } => {
                // Coil value: 0xFF00 for ON, 0x0000 for OFF
                buf.put_u16(*address)?;
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 })
            }
            Self::WriteSingleRegister { address, value } => {
                buf.put_u16(*address)?;
                buf.put_u16(*value)
            }
            Self::WriteMultipleCoils { address, values } => {
                let byte_count = values.len().div_ceil(8);
                buf.put_u16(*address)?;
                buf.put_u16(values.len() as u16)?;
                buf.put_u8(byte_count as u8)?;

                for chunk in values.chunks(8) {
                    let packed = chunk
                        .iter()
                        .enumerate()
                        .fold(0u8, |acc, (bit, &on)| acc | (u8::from(on) << bit));
                    buf.put_u8(packed)?;
                }
                Ok(())
            }
            Self::WriteMultipleRegisters { address, values } => {
                buf.put_u16(*address)?;
                buf.put_u16(values.len() as u16)?;
                buf.put_u8((values.len() * 2) as u8)?;
                for value in values {
                    buf.put_u16(*value)?;
                }
                Ok(())
            }
            Self::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => {
                buf.put_u16(*address)?;
                buf.put_u16(*and_mask)?;
                buf.put_u16(*or_mask)
            }
        }
    }
}
