//! PLC I/O links for the HMI.
//!
//! This crate provides:
//! - [`LinkClient`], a handle to a per-link engine task that connects,
//!   reconnects, queues, sends and correlates transactions
//! - [`Protocol`], the seam a wire protocol implements to ride the engine
//! - [`modbus`] module with the Modbus TCP client
//! - [`mr`] module with the MR master
//! - [`Connector`] implementations for dialing and accepting TCP streams
//!
//! # Example
//!
//! ```no_run
//! use hmi_common::LinkConfig;
//! use hmi_plcio::modbus::ModbusClient;
//! use hmi_plcio::LinkOptions;
//!
//! # async fn run() -> hmi_common::LinkResult<()> {
//! let config = LinkConfig::default();
//! let modbus = config.modbus.clone().unwrap_or_default();
//! let client = ModbusClient::connect(&modbus, LinkOptions::from_config(&config));
//!
//! // Queued until the connection is up
//! let id = client.read_holding_registers(0, 10, None)?;
//! assert_ne!(id, 0);
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod engine;
pub mod modbus;
pub mod mr;
pub mod pdu;
pub mod protocol;
pub mod transaction;
pub mod transaction_id;
pub mod transport;

pub use client::{LinkClient, LinkOptions};
pub use codec::{FrameCodec, Inbound};
pub use engine::EngineReport;
pub use pdu::{PduBuffer, PduPool};
pub use protocol::{Dispatch, FramingFault, Protocol, Reply};
pub use transaction::{Transaction, TransactionTable};
pub use transaction_id::TransactionIdGenerator;
pub use transport::{Connector, TcpAcceptor, TcpConnector};
