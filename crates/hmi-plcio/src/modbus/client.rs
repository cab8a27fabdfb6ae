//! Typed request helpers for a Modbus TCP link.

use super::confirm::ModbusConfirmation;
use super::frame::ModbusTcp;
use super::request::ModbusRequest;
use crate::client::{LinkClient, LinkOptions};
use crate::transport::TcpConnector;
use hmi_common::{LinkResult, ModbusConfig};
use std::sync::Arc;

/// A link speaking Modbus TCP.
pub type ModbusClient = LinkClient<ModbusTcp>;

/// Optional reply listener.
pub type Confirm = Option<Arc<dyn ModbusConfirmation>>;

impl LinkClient<ModbusTcp> {
    /// Dial the configured device and start the engine.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn connect(config: &ModbusConfig, mut options: LinkOptions) -> Self {
        options.debug |= config.debug;
        Self::spawn(
            ModbusTcp::new(config.unit_id),
            TcpConnector::new(config.address.clone()),
            options,
        )
    }

    /// Read `quantity` coils (FC 0x01).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn read_coils(&self, address: u16, quantity: u16, confirm: Confirm) -> LinkResult<u16> {
        self.request(ModbusRequest::ReadCoils { address, quantity }, confirm)
    }

    /// Read `quantity` discrete inputs (FC 0x02).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(ModbusRequest::ReadDiscreteInputs { address, quantity }, confirm)
    }

    /// Read `quantity` holding registers (FC 0x03).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(
            ModbusRequest::ReadHoldingRegisters { address, quantity },
            confirm,
        )
    }

    /// Read `quantity` input registers (FC 0x04).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(
            ModbusRequest::ReadInputRegisters { address, quantity },
            confirm,
        )
    }

    /// Force one coil (FC 0x05).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_single_coil(&self, address: u16, value: bool, confirm: Confirm) -> LinkResult<u16> {
        self.request(ModbusRequest::WriteSingleCoil { address, value }, confirm)
    }

    /// Write one holding register (FC 0x06).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_single_register(
        &self,
        address: u16,
        value: u16,
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(ModbusRequest::WriteSingleRegister { address, value }, confirm)
    }

    /// Force a run of coils (FC 0x0F).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_multiple_coils(
        &self,
        address: u16,
        values: &[bool],
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(
            ModbusRequest::WriteMultipleCoils {
                address,
                values: values.to_vec(),
            },
            confirm,
        )
    }

    /// Write a run of holding registers (FC 0x10).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(
            ModbusRequest::WriteMultipleRegisters {
                address,
                values: values.to_vec(),
            },
            confirm,
        )
    }

    /// Mask write a holding register (FC 0x16).
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn mask_write_register(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
        confirm: Confirm,
    ) -> LinkResult<u16> {
        self.request(
            ModbusRequest::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            },
            confirm,
        )
    }
}
