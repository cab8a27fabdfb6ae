//! The MR master: read all signals, write analog and digital quantities.

use super::frame::{MrAddress, MrProtocol, MrRequest};
use crate::client::{LinkClient, LinkOptions};
use crate::transport::{TcpAcceptor, TcpConnector};
use hmi_common::{LinkResult, MrConfig};

/// A link speaking MR.
pub type MrMaster = LinkClient<MrProtocol>;

impl LinkClient<MrProtocol> {
    /// Dial the configured host, or listen on the configured port when no
    /// host is set, and start the engine.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn start(config: &MrConfig, options: LinkOptions) -> Self {
        let protocol = MrProtocol::from_config(config);
        match &config.host {
            Some(host) => Self::spawn(
                protocol,
                TcpConnector::new(format!("{host}:{}", config.port)),
                options,
            ),
            None => Self::spawn(protocol, TcpAcceptor::new(config.port), options),
        }
    }

    /// Ask the device for the signals of `db` in `[addr0, addrn]`.
    ///
    /// The reply goes to every registered listener.
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn read_all_signal(&self, db: u16, addr0: u16, addrn: u16, tidemark: f32) -> LinkResult<u16> {
        self.request(
            MrRequest::ReadSignal {
                address: MrAddress { db, addr0, addrn },
                tidemark,
            },
            None,
        )
    }

    /// Write analog quantities into `db`.
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_analog_quantity(
        &self,
        db: u16,
        addr0: u16,
        addrn: u16,
        values: &[f32],
    ) -> LinkResult<u16> {
        self.request(
            MrRequest::WriteAnalog {
                address: MrAddress { db, addr0, addrn },
                values: values.to_vec(),
            },
            None,
        )
    }

    /// Write digital quantities into `db`.
    ///
    /// # Errors
    ///
    /// See [`LinkClient::request`].
    pub fn write_digital_quantity(
        &self,
        db: u16,
        addr0: u16,
        addrn: u16,
        values: &[u8],
    ) -> LinkResult<u16> {
        self.request(
            MrRequest::WriteDigital {
                address: MrAddress { db, addr0, addrn },
                values: values.to_vec(),
            },
            None,
        )
    }
}
