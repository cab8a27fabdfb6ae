//! Shared helpers for the link integration tests.
//!
//! - [`scripted`] returns a [`Connector`] fed by the test, so each connect
//!   attempt can be answered with an in-memory stream or a refusal.
//! - [`ModbusPeer`] plays the device end of such a stream byte for byte.
//! - [`Recorder`] turns confirmation callbacks into an awaitable event queue.

#![allow(dead_code)]

use bytes::BytesMut;
use hmi_common::TransactionFailure;
use hmi_plcio::modbus::{encode_request, MbapHeader, ModbusConfirmation};
use hmi_plcio::{Connector, LinkOptions};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long any single step may take before the test fails.
pub const STEP: Duration = Duration::from_secs(5);

/// Options with short reconnect delays.
pub fn options() -> LinkOptions {
    let mut options = LinkOptions::default();
    options.reconnect.initial_delay = Duration::from_millis(10);
    options.reconnect.max_delay = Duration::from_millis(50);
    options
}

/// Wait for `condition`, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(STEP, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Await `future` or fail the test.
pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(STEP, future).await.expect("step timed out")
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Test side of a [`ScriptedConnector`].
pub struct Script {
    attempts: mpsc::UnboundedSender<io::Result<DuplexStream>>,
}

impl Script {
    /// Answer the next connect attempt with a fresh stream; returns the
    /// device end.
    pub fn accept(&self) -> ModbusPeer {
        ModbusPeer {
            stream: self.accept_raw(),
        }
    }

    /// Like [`accept`](Self::accept) but returns the bare stream.
    pub fn accept_raw(&self) -> DuplexStream {
        let (client, device) = tokio::io::duplex(64 * 1024);
        self.attempts
            .send(Ok(client))
            .expect("connector dropped");
        device
    }

    /// Refuse the next connect attempt.
    pub fn refuse(&self) {
        self.attempts
            .send(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
            .expect("connector dropped");
    }
}

/// Connector whose attempts are answered by a [`Script`]. An attempt with
/// no answer queued waits forever.
pub struct ScriptedConnector {
    attempts: mpsc::UnboundedReceiver<io::Result<DuplexStream>>,
}

pub fn scripted() -> (Script, ScriptedConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Script { attempts: tx }, ScriptedConnector { attempts: rx })
}

impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&mut self) -> io::Result<DuplexStream> {
        match self.attempts.recv().await {
            Some(attempt) => attempt,
            None => std::future::pending().await,
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

// ============================================================================
// Modbus device end
// ============================================================================

/// The device end of a scripted Modbus TCP stream.
pub struct ModbusPeer {
    stream: DuplexStream,
}

impl ModbusPeer {
    /// Read one request frame: header and PDU (function code first).
    pub async fn read_request(&mut self) -> (MbapHeader, Vec<u8>) {
        within(async {
            let mut header = [0u8; MbapHeader::SIZE];
            self.stream.read_exact(&mut header).await.expect("read header");
            let header = MbapHeader::decode(&header).expect("decode header");
            let mut pdu = vec![0u8; header.pdu_len().expect("pdu length")];
            self.stream.read_exact(&mut pdu).await.expect("read pdu");
            (header, pdu)
        })
        .await
    }

    /// Answer `transaction_id` with `pdu` (function code first).
    pub async fn reply(&mut self, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
        let mut frame = BytesMut::new();
        encode_request(&mut frame, transaction_id, unit_id, pdu[0], &pdu[1..]);
        self.write_raw(&frame).await;
    }

    /// Write bytes verbatim.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
        self.stream.flush().await.expect("flush");
    }

    /// Assert the client end has been dropped.
    pub async fn assert_closed(&mut self) {
        let mut buf = [0u8; 1];
        let read = within(self.stream.read(&mut buf)).await;
        assert!(matches!(read, Ok(0)), "stream still open: {read:?}");
    }
}

// ============================================================================
// Confirmation recorder
// ============================================================================

/// A decoded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Coils {
        id: u16,
        address: u16,
        status: Vec<u8>,
        count: u16,
    },
    DiscreteInputs {
        id: u16,
        address: u16,
        status: Vec<u8>,
        count: u16,
    },
    HoldingRegisters {
        id: u16,
        address: u16,
        registers: Vec<u16>,
    },
    InputRegisters {
        id: u16,
        address: u16,
        registers: Vec<u16>,
    },
    Echo {
        id: u16,
        function_code: u8,
        address: u16,
        value: u16,
    },
    MaskEcho {
        id: u16,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    },
    Exception {
        id: u16,
        function_code: u8,
        reason: u8,
    },
    Failure {
        id: u16,
        function_code: u8,
        failure: TransactionFailure,
    },
}

/// Forwards every callback to an [`Events`] queue.
pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events: tx }), Events(rx))
    }

    fn push(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Erase a recorder into the optional confirmation requests take.
pub fn confirm(recorder: &Arc<Recorder>) -> Option<Arc<dyn ModbusConfirmation>> {
    let confirmation: Arc<dyn ModbusConfirmation> = recorder.clone();
    Some(confirmation)
}

impl ModbusConfirmation for Recorder {
    fn on_coils(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {
        self.push(Event::Coils {
            id: transaction_id,
            address,
            status: status.to_vec(),
            count,
        });
    }

    fn on_discrete_inputs(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {
        self.push(Event::DiscreteInputs {
            id: transaction_id,
            address,
            status: status.to_vec(),
            count,
        });
    }

    fn on_holding_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {
        self.push(Event::HoldingRegisters {
            id: transaction_id,
            address,
            registers: registers.to_vec(),
        });
    }

    fn on_input_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {
        self.push(Event::InputRegisters {
            id: transaction_id,
            address,
            registers: registers.to_vec(),
        });
    }

    fn on_echo_response(&self, transaction_id: u16, function_code: u8, address: u16, value: u16) {
        self.push(Event::Echo {
            id: transaction_id,
            function_code,
            address,
            value,
        });
    }

    fn on_mask_echo_response(
        &self,
        transaction_id: u16,
        _function_code: u8,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) {
        self.push(Event::MaskEcho {
            id: transaction_id,
            address,
            and_mask,
            or_mask,
        });
    }

    fn on_exception(&self, transaction_id: u16, function_code: u8, reason: u8) {
        self.push(Event::Exception {
            id: transaction_id,
            function_code,
            reason,
        });
    }

    fn on_failure(&self, transaction_id: u16, function_code: u8, failure: TransactionFailure) {
        self.push(Event::Failure {
            id: transaction_id,
            function_code,
            failure,
        });
    }
}

/// Callbacks in the order they fired.
pub struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    /// The next callback, failing the test if none arrives in time.
    pub async fn next(&mut self) -> Event {
        within(self.0.recv()).await.expect("recorder dropped")
    }

    /// Assert no callback has fired yet.
    pub fn assert_empty(&mut self) {
        if let Ok(event) = self.0.try_recv() {
            panic!("unexpected callback: {event:?}");
        }
    }
}
