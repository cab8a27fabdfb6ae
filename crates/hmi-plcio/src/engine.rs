//! The per-link engine task.
//!
//! One engine owns the transport, the transaction table and the PDU pool of
//! a single link. It is the only consumer of the client's command channel,
//! so none of that state is shared or locked.
//!
//! ```text
//!            +----------+  connect ok   +-----------+
//!   start -> |Connecting| ------------> | Connected |
//!            +----------+               +-----------+
//!              |  ^   | attempts             | transport fault
//!     failure  |  |   | exhausted            v
//!              v  |   v               +--------------+
//!     +------------+ +------+         | Disconnected |
//!     |Disconnected| |Failed|         +--------------+
//!     +------------+ +------+          (policy, backoff)
//!                     | reconnect()
//!                     +-> Connecting
//! ```

use crate::codec::{FrameCodec, Inbound};
use crate::pdu::PduPool;
use crate::protocol::{Dispatch, Protocol, Reply};
use crate::transaction::{Transaction, TransactionTable};
use crate::transport::Connector;
use futures_util::{SinkExt, StreamExt};
use hmi_common::{
    ConnectionState, InFlightPolicy, LinkError, LinkMetrics, LinkResult, ReconnectConfig,
    StateMachine, TransactionFailure,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

/// Messages from a [`LinkClient`](crate::LinkClient) to its engine.
pub(crate) enum Command<P: Protocol> {
    /// Queue or send a request under an already issued id.
    Request {
        id: u16,
        request: P::Request,
        confirmation: Option<Arc<P::Confirmation>>,
    },
    /// Register a broadcast listener.
    Listen(Arc<P::Confirmation>),
    /// Close an open circuit or skip the current backoff.
    Reconnect,
}

/// What the engine left behind when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineReport {
    /// Queued transactions dropped without a callback.
    pub discarded_pending: usize,
    /// In-flight transactions dropped without a callback.
    pub discarded_in_flight: usize,
    /// Payload buffers not returned to the pool.
    pub outstanding_buffers: usize,
}

/// Engine tunables taken from [`LinkOptions`](crate::LinkOptions).
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub reconnect: ReconnectConfig,
    pub timeout: Option<Duration>,
    pub in_flight_policy: InFlightPolicy,
    pub debug: bool,
}

/// Why the serve loop returned.
enum Exit {
    Shutdown,
    Fault(LinkError),
}

/// Channels connecting the engine to its handle.
pub(crate) struct EngineChannels<P: Protocol> {
    pub commands: mpsc::UnboundedReceiver<Command<P>>,
    pub shutdown: oneshot::Receiver<()>,
    pub state: watch::Sender<ConnectionState>,
}

/// Everything the engine owns except the connector and its inputs.
///
/// Split out so a pinned connect future (borrowing the connector) can run
/// alongside command handling.
struct Core<P: Protocol> {
    protocol: P,
    table: TransactionTable<P>,
    pool: PduPool,
    listeners: Vec<Arc<P::Confirmation>>,
    metrics: Arc<LinkMetrics>,
    machine: StateMachine,
    state: watch::Sender<ConnectionState>,
    next_sequence: u64,
    debug: bool,
}

pub(crate) struct Engine<P: Protocol, C: Connector> {
    connector: C,
    commands: mpsc::UnboundedReceiver<Command<P>>,
    shutdown: oneshot::Receiver<()>,
    settings: EngineSettings,
    /// Consecutive failed connects and unstable connections.
    faults: u32,
    core: Core<P>,
}

impl<P: Protocol, C: Connector> Engine<P, C> {
    pub(crate) fn new(
        protocol: P,
        connector: C,
        channels: EngineChannels<P>,
        settings: EngineSettings,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        let debug = settings.debug;
        Self {
            connector,
            commands: channels.commands,
            shutdown: channels.shutdown,
            settings,
            faults: 0,
            core: Core {
                protocol,
                table: TransactionTable::new(),
                pool: PduPool::new(P::MAX_PDU_SIZE),
                listeners: Vec::new(),
                metrics,
                machine: StateMachine::new(),
                state: channels.state,
                next_sequence: 0,
                debug,
            },
        }
    }

    /// Run until the handle shuts the link down or is dropped.
    pub(crate) async fn run(mut self) -> EngineReport {
        info!(
            protocol = P::NAME,
            endpoint = %self.connector.describe(),
            "link engine started"
        );

        while let Some(stream) = self.establish().await {
            let connected_at = Instant::now();
            match self.serve(stream).await {
                Exit::Shutdown => break,
                Exit::Fault(err) => {
                    self.on_fault(&err);
                    if connected_at.elapsed() >= self.settings.reconnect.stable_after {
                        self.faults = 0;
                    }
                    if !self.back_off(&err).await {
                        break;
                    }
                }
            }
        }

        self.teardown()
    }

    /// Connect, retrying with backoff. `None` means shut down.
    async fn establish(&mut self) -> Option<C::Stream> {
        loop {
            self.core.transition(ConnectionState::Connecting);

            let connected = {
                let connect = self.connector.connect();
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut self.shutdown => return None,
                        command = self.commands.recv() => match command {
                            Some(command) => self.core.offline(command),
                            None => return None,
                        },
                        result = &mut connect => break result,
                    }
                }
            };

            match connected {
                Ok(stream) => {
                    self.core.transition(ConnectionState::Connected);
                    self.core.metrics.record_connect();
                    info!(
                        endpoint = %self.connector.describe(),
                        pending = self.core.table.pending_len(),
                        "link connected"
                    );
                    return Some(stream);
                }
                Err(err) => {
                    self.core.metrics.record_connect_failure();
                    if !self.back_off(&LinkError::from(err)).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Count one more consecutive fault, then either wait out the backoff or
    /// open the circuit. `false` means shut down.
    async fn back_off(&mut self, err: &LinkError) -> bool {
        self.faults = self.faults.saturating_add(1);
        let attempts = self.faults;

        if self
            .settings
            .reconnect
            .max_attempts
            .is_some_and(|max| attempts >= max)
        {
            self.core.transition(ConnectionState::Failed);
            error!(
                error = %err,
                attempts,
                "reconnect attempts exhausted, circuit open"
            );
            self.core.fail_pending(TransactionFailure::Unreachable);
            self.faults = 0;
            return self.circuit_open().await;
        }

        self.core.transition(ConnectionState::Disconnected);
        let delay = self.settings.reconnect.backoff(attempts);
        warn!(
            error = %err,
            attempt = attempts,
            retry_in = ?delay,
            "link down, retrying"
        );
        self.pause(delay).await
    }

    /// Sleep for `delay` while still accepting commands. `false` means shut down.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => return true,
                    Some(command) => self.core.offline(command),
                    None => return false,
                },
                () = &mut sleep => return true,
            }
        }
    }

    /// Park with the circuit open until a reconnect is requested.
    async fn circuit_open(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => {
                        info!("reconnect requested, closing circuit");
                        return true;
                    }
                    Some(Command::Request { id, request, confirmation }) => {
                        if let Some(transaction) = self.core.admit(id, &request, confirmation) {
                            debug!(id, "circuit open, failing request");
                            self.core.retire(transaction, Some(TransactionFailure::Unreachable));
                        }
                    }
                    Some(Command::Listen(listener)) => self.core.listeners.push(listener),
                    None => return false,
                },
            }
        }
    }

    /// Drain the pending queue, then multiplex commands, replies and timeouts.
    async fn serve(&mut self, stream: C::Stream) -> Exit {
        let mut framed = Framed::new(stream, FrameCodec::new(self.core.protocol.clone()));

        if let Err(err) = self.core.drain_to(&mut framed).await {
            return Exit::Fault(err);
        }

        let mut sweep = self.settings.timeout.map(|timeout| {
            let mut sweep = tokio::time::interval(sweep_period(timeout));
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep
        });

        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return Exit::Shutdown,
                // Replies before new requests so a request burst cannot stall them
                inbound = framed.next() => match inbound {
                    Some(Ok(inbound)) => {
                        if matches!(inbound, Inbound::Frame { .. }) {
                            self.faults = 0;
                        }
                        self.core.on_inbound(inbound);
                    }
                    Some(Err(err)) => return Exit::Fault(err),
                    None => return Exit::Fault(LinkError::PeerLost),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Request { id, request, confirmation }) => {
                        if let Some(transaction) = self.core.admit(id, &request, confirmation) {
                            if let Err(err) = self.core.enqueue_or_send(&mut framed, transaction).await {
                                return Exit::Fault(err);
                            }
                        }
                    }
                    Some(Command::Listen(listener)) => self.core.listeners.push(listener),
                    Some(Command::Reconnect) => debug!("reconnect requested while connected, ignored"),
                    None => return Exit::Shutdown,
                },
                () = tick(&mut sweep) => {
                    if let Some(timeout) = self.settings.timeout {
                        self.core.expire(timeout);
                    }
                }
            }
        }
    }

    /// The stream is already dropped; settle the in-flight table.
    fn on_fault(&mut self, err: &LinkError) {
        let in_flight = self.core.table.take_in_flight();
        warn!(
            error = %err,
            in_flight = in_flight.len(),
            policy = ?self.settings.in_flight_policy,
            "transport fault, reconnecting"
        );
        self.core.transition(ConnectionState::Disconnected);
        self.core.metrics.record_reconnect();

        match self.settings.in_flight_policy {
            InFlightPolicy::Abandon => {
                for transaction in in_flight {
                    self.core.retire(transaction, None);
                }
            }
            InFlightPolicy::Requeue => self.core.table.requeue(in_flight),
            InFlightPolicy::Fail => {
                for transaction in in_flight {
                    self.core
                        .retire(transaction, Some(TransactionFailure::ConnectionLost));
                }
            }
        }
    }

    /// Reclaim every buffer without invoking callbacks.
    fn teardown(mut self) -> EngineReport {
        // Requests already issued count as discarded even if never admitted
        while let Ok(command) = self.commands.try_recv() {
            self.core.offline(command);
        }

        let discarded_pending = self.core.table.pending_len();
        let discarded_in_flight = self.core.table.in_flight_len();
        for transaction in self.core.table.drain_all() {
            self.core.pool.release(transaction.payload);
        }

        let report = EngineReport {
            discarded_pending,
            discarded_in_flight,
            outstanding_buffers: self.core.pool.outstanding(),
        };
        self.core.pool.clear();
        self.core.listeners.clear();
        if self.core.machine.state() != ConnectionState::Failed {
            self.core.transition(ConnectionState::Disconnected);
        }

        info!(
            discarded_pending,
            discarded_in_flight, "link engine stopped"
        );
        report
    }
}

impl<P: Protocol> Core<P> {
    fn transition(&mut self, target: ConnectionState) {
        if self.machine.state() == target {
            return;
        }
        match self.machine.transition(target) {
            Ok(()) => {
                self.state.send_replace(target);
            }
            Err(err) => warn!(error = %err, "connection state not updated"),
        }
    }

    /// Encode a request into a pooled buffer.
    fn admit(
        &mut self,
        id: u16,
        request: &P::Request,
        confirmation: Option<Arc<P::Confirmation>>,
    ) -> Option<Transaction<P>> {
        let mut payload = self.pool.acquire();
        if let Err(err) = P::encode_payload(request, &mut payload) {
            error!(id, error = %err, ?request, "request does not fit a PDU, dropped");
            self.pool.release(payload);
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Transaction {
            id,
            function_code: P::function_code(request),
            address: self.protocol.address(request),
            payload,
            confirmation,
            sequence,
            sent_at: None,
        })
    }

    /// Handle a command while no transport exists.
    fn offline(&mut self, command: Command<P>) {
        match command {
            Command::Request {
                id,
                request,
                confirmation,
            } => {
                if let Some(transaction) = self.admit(id, &request, confirmation) {
                    trace!(id, "queued until connected");
                    self.table.enqueue(transaction);
                }
            }
            Command::Listen(listener) => self.listeners.push(listener),
            Command::Reconnect => {}
        }
    }

    /// Send every queued transaction, oldest first.
    async fn drain_to<S>(&mut self, framed: &mut Framed<S, FrameCodec<P>>) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(transaction) = self.table.pop_pending() {
            self.enqueue_or_send(framed, transaction).await?;
        }
        Ok(())
    }

    /// Send one transaction. On failure it goes back to the front of the
    /// pending queue and the error faults the connection.
    async fn enqueue_or_send<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec<P>>,
        mut transaction: Transaction<P>,
    ) -> LinkResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(err) = framed.send(&transaction).await {
            self.table.push_front_pending(transaction);
            return Err(err);
        }

        transaction.sent_at = Some(Instant::now());
        self.metrics.record_frame_sent();
        if self.debug {
            debug!(
                id = transaction.id,
                function_code = transaction.function_code,
                payload = ?transaction.payload.as_slice(),
                "frame sent"
            );
        } else {
            trace!(
                id = transaction.id,
                function_code = transaction.function_code,
                len = transaction.payload.len(),
                "frame sent"
            );
        }

        if P::CORRELATED {
            if let Some(displaced) = self.table.mark_in_flight(transaction) {
                self.retire(displaced, None);
            }
        } else {
            self.pool.release(transaction.payload);
        }
        Ok(())
    }

    fn on_inbound(&mut self, inbound: Inbound<P::Header>) {
        let (header, body) = match inbound {
            Inbound::Frame { header, body } => (header, body),
            Inbound::Malformed { header, fault } => {
                self.metrics.record_framing_fault();
                warn!(?header, %fault, "discarding malformed frame");
                // The id was answered, badly; no second reply will come
                let answered = P::transaction_id(&header).and_then(|id| self.table.complete(id).ok());
                if let Some(transaction) = answered {
                    debug!(id = transaction.id, "retiring transaction of malformed reply");
                    self.retire(transaction, None);
                }
                return;
            }
        };

        let transaction = match P::transaction_id(&header) {
            Some(id) => match self.table.complete(id) {
                Ok(transaction) => Some(transaction),
                Err(err) => {
                    self.metrics.record_correlation_miss();
                    debug!(error = %err, len = body.len(), "discarding reply");
                    return;
                }
            },
            None => None,
        };

        if let Some(sent_at) = transaction.as_ref().and_then(|tx| tx.sent_at) {
            self.metrics.record_latency(sent_at.elapsed());
        }
        if self.debug {
            debug!(?header, body = ?&body[..], "frame received");
        }

        self.metrics.record_reply();
        let reply = Reply {
            header,
            body: &body,
            transaction: transaction.as_ref(),
        };
        match self.protocol.confirm(reply, &self.listeners) {
            Dispatch::Confirmed { unconsumed } => {
                if unconsumed > 0 {
                    debug!(unconsumed, "discarding unconsumed reply bytes");
                    self.metrics.record_discarded(unconsumed);
                }
            }
            Dispatch::Exception {
                function_code,
                reason,
            } => {
                self.metrics.record_exception();
                debug!(function_code, reason, "exception reply");
            }
            Dispatch::FunctionMismatch { expected, received } => {
                self.metrics.record_function_mismatch();
                warn!(
                    expected,
                    received, "reply function code does not match request"
                );
            }
            Dispatch::Undecodable(err) => {
                self.metrics.record_discarded(body.len());
                warn!(error = %err, "reply too short for its function code");
            }
            Dispatch::Ignored => trace!("reply has no listener"),
        }

        if let Some(transaction) = transaction {
            self.pool.release(transaction.payload);
        }
    }

    fn expire(&mut self, timeout: Duration) {
        for transaction in self.table.take_expired(Instant::now(), timeout) {
            self.metrics.record_timeout();
            warn!(
                id = transaction.id,
                function_code = transaction.function_code,
                ?timeout,
                "transaction timed out"
            );
            self.retire(transaction, Some(TransactionFailure::TimedOut));
        }
    }

    fn fail_pending(&mut self, failure: TransactionFailure) {
        while let Some(transaction) = self.table.pop_pending() {
            self.retire(transaction, Some(failure));
        }
    }

    /// Return the buffer, reporting `failure` to the confirmation first.
    fn retire(&mut self, transaction: Transaction<P>, failure: Option<TransactionFailure>) {
        if let Some(failure) = failure {
            self.protocol.fail(&transaction, failure);
        }
        self.pool.release(transaction.payload);
    }
}

/// How often in-flight transactions are checked against `timeout`.
fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 4).max(Duration::from_millis(1))
}

async fn tick(sweep: &mut Option<Interval>) {
    match sweep {
        Some(sweep) => {
            sweep.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_period() {
        assert_eq!(
            sweep_period(Duration::from_secs(2)),
            Duration::from_millis(500)
        );
        assert_eq!(
            sweep_period(Duration::from_micros(10)),
            Duration::from_millis(1)
        );
    }
}
