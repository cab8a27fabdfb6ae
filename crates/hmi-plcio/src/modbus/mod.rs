//! Modbus TCP client.
//!
//! Supports the function codes the HMI polls and writes:
//! - 0x01: Read Coils
//! - 0x02: Read Discrete Inputs
//! - 0x03: Read Holding Registers
//! - 0x04: Read Input Registers
//! - 0x05: Write Single Coil
//! - 0x06: Write Single Register
//! - 0x0F: Write Multiple Coils
//! - 0x10: Write Multiple Registers
//! - 0x16: Mask Write Register

mod client;
mod confirm;
mod frame;
mod request;

pub use client::{Confirm, ModbusClient};
pub use confirm::ModbusConfirmation;
pub use frame::{encode_request, MbapHeader, ModbusTcp, MAX_PDU_DATA};
pub use request::{
    ExceptionCode, FunctionCode, ModbusRequest, MAX_READ_BITS, MAX_READ_REGISTERS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
