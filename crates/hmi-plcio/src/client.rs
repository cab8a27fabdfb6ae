//! The caller-facing link handle.

use crate::engine::{Command, Engine, EngineChannels, EngineReport, EngineSettings};
use crate::protocol::Protocol;
use crate::transaction_id::TransactionIdGenerator;
use crate::transport::Connector;
use hmi_common::{
    ConnectionState, InFlightPolicy, LinkConfig, LinkError, LinkMetrics, LinkResult,
    ReconnectConfig,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

/// Settings for one link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Reconnect backoff and circuit breaker.
    pub reconnect: ReconnectConfig,
    /// Retire in-flight transactions after this long without a reply.
    pub timeout: Option<Duration>,
    /// What happens to in-flight transactions on a transport fault.
    pub in_flight_policy: InFlightPolicy,
    /// Samples kept by the latency histogram.
    pub histogram_size: usize,
    /// Id source, shared with other links when ids must be globally unique.
    pub ids: Arc<TransactionIdGenerator>,
    /// Name used in logs; defaults to protocol and endpoint.
    pub description: Option<String>,
    /// Log every frame at debug level.
    pub debug: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

impl LinkOptions {
    /// Options from the shared `[reconnect]` and `[transactions]` sections.
    #[must_use]
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            timeout: config.transactions.timeout,
            in_flight_policy: config.transactions.in_flight_policy,
            histogram_size: config.transactions.histogram_size,
            ids: Arc::new(TransactionIdGenerator::default()),
            description: None,
            debug: false,
        }
    }

    /// Draw ids from a shared generator.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<TransactionIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Name the link in logs.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Handle to a running link engine.
///
/// Requests may be issued in any connection state; they are queued until a
/// transport exists. Dropping the handle stops the engine at its next await
/// point without invoking any callback.
pub struct LinkClient<P: Protocol> {
    description: String,
    commands: mpsc::UnboundedSender<Command<P>>,
    ids: Arc<TransactionIdGenerator>,
    state: watch::Receiver<ConnectionState>,
    metrics: Arc<LinkMetrics>,
    shutdown: oneshot::Sender<()>,
    engine: JoinHandle<EngineReport>,
}

impl<P: Protocol> fmt::Debug for LinkClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkClient")
            .field("description", &self.description)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<P: Protocol> LinkClient<P> {
    /// Start an engine task for `protocol` over streams from `connector`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<C: Connector>(protocol: P, connector: C, options: LinkOptions) -> Self {
        let description = options
            .description
            .unwrap_or_else(|| format!("{} {}", P::NAME, connector.describe()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let metrics = Arc::new(LinkMetrics::new(options.histogram_size));

        let engine = Engine::new(
            protocol,
            connector,
            EngineChannels {
                commands: commands_rx,
                shutdown: shutdown_rx,
                state: state_tx,
            },
            EngineSettings {
                reconnect: options.reconnect,
                timeout: options.timeout,
                in_flight_policy: options.in_flight_policy,
                debug: options.debug,
            },
            Arc::clone(&metrics),
        );
        let span = info_span!("link", link = %description);
        let engine = tokio::spawn(engine.run().instrument(span));

        Self {
            description,
            commands: commands_tx,
            ids: options.ids,
            state: state_rx,
            metrics,
            shutdown: shutdown_tx,
            engine,
        }
    }

    /// Issue a request and return its transaction id.
    ///
    /// `confirmation` receives the reply; `None` sends fire and forget.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] if the request violates
    /// protocol limits (nothing is queued), or [`LinkError::Closed`] if the
    /// engine has stopped.
    pub fn request(
        &self,
        request: P::Request,
        confirmation: Option<Arc<P::Confirmation>>,
    ) -> LinkResult<u16> {
        P::validate_request(&request)?;
        let id = self.ids.next();
        self.commands
            .send(Command::Request {
                id,
                request,
                confirmation,
            })
            .map_err(|_| LinkError::Closed)?;
        self.metrics.record_request();
        Ok(id)
    }

    /// Register a listener for broadcast replies.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] if the engine has stopped.
    pub fn append_confirmation_receiver(&self, listener: Arc<P::Confirmation>) -> LinkResult<()> {
        self.commands
            .send(Command::Listen(listener))
            .map_err(|_| LinkError::Closed)
    }

    /// Close an open circuit, or cut the current backoff short.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] if the engine has stopped.
    pub fn reconnect(&self) -> LinkResult<()> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| LinkError::Closed)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns true while a transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the link reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] if the engine stops first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> LinkResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::Closed)
    }

    /// Counters and latency histogram of this link.
    #[must_use]
    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// The id generator requests draw from.
    #[must_use]
    pub fn transaction_ids(&self) -> &Arc<TransactionIdGenerator> {
        &self.ids
    }

    /// Name of the link in logs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Stop the engine and wait for it to release its resources.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] if the engine task panicked or was
    /// aborted.
    pub async fn shutdown(self) -> LinkResult<EngineReport> {
        let Self {
            shutdown, engine, ..
        } = self;
        // The engine may already be gone; the join below still reports it
        let _ = shutdown.send(());
        engine.await.map_err(|_| LinkError::Closed)
    }
}
