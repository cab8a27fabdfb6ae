//! HMI link daemon entry point.
//!
//! Starts the configured Modbus TCP and MR links, drives their periodic
//! polls, logs every confirmation and reports link status until a
//! termination signal or the maximum runtime ends it.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use hmi_common::{
    LinkConfig, LinkError, LinkResult, ModbusPoll, ModbusPollKind, MrPoll, TransactionFailure,
};
use hmi_plcio::modbus::{ExceptionCode, ModbusClient, ModbusConfirmation};
use hmi_plcio::mr::{MrConfirmation, MrMaster};
use hmi_plcio::{EngineReport, LinkClient, LinkOptions, Protocol};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::diagnostics::{format_prometheus_metrics, DiagnosticsState, LinkHealth};
use crate::signals::wait_for_shutdown;

/// HMI link daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "hmi-linkd",
    about = "HMI link daemon - Modbus TCP and MR links to the dredge PLCs",
    version,
    long_about = None
)]
struct Args {
    /// Path to a link configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Stop after this long (e.g. `30s`, `5m`).
    #[arg(long, value_parser = humantime::parse_duration)]
    max_runtime: Option<Duration>,

    /// Write a JSON metrics snapshot to FILE on shutdown.
    #[arg(long, value_name = "FILE")]
    dump_metrics: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting HMI link daemon");

    let config = load_config(args.config.as_deref())?;
    config.validate().context("Invalid configuration")?;
    info!(
        modbus = config.modbus.is_some(),
        mr = config.mr.is_some(),
        in_flight_policy = ?config.transactions.in_flight_policy,
        "Configuration loaded"
    );

    run_daemon(&config, &args).await
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("hmi_linkd={level},hmi_plcio={level},hmi_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `HMI_CONFIG_PATH` environment variable
/// 3. `/etc/hmi/link.toml` (system path)
/// 4. `config/link.toml` (local development)
/// 5. Built-in defaults
fn load_config(explicit: Option<&Path>) -> Result<LinkConfig> {
    if let Some(config_path) = explicit {
        info!(?config_path, "Loading config from command-line argument");
        return LinkConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("HMI_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from HMI_CONFIG_PATH");
            return LinkConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from HMI_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "HMI_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/hmi/link.toml", "config/link.toml"] {
        let config_path = Path::new(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return LinkConfig::from_file(config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(LinkConfig::default())
}

/// The running links.
struct Links {
    modbus: Option<Arc<ModbusClient>>,
    mr: Option<Arc<MrMaster>>,
}

impl Links {
    fn start(config: &LinkConfig, listener: &Arc<LoggingConfirmation>) -> Result<Self> {
        let options = LinkOptions::from_config(config);

        let modbus = config.modbus.as_ref().map(|modbus| {
            let options = options.clone().with_description(format!("modbus {}", modbus.address));
            Arc::new(ModbusClient::connect(modbus, options))
        });

        let mr = match &config.mr {
            Some(mr) => {
                let endpoint = match &mr.host {
                    Some(host) => format!("mr {host}:{}", mr.port),
                    None => format!("mr listen :{}", mr.port),
                };
                let master = MrMaster::start(mr, options.with_description(endpoint));
                let receiver: Arc<dyn MrConfirmation> = listener.clone();
                master
                    .append_confirmation_receiver(receiver)
                    .context("MR link stopped before it started")?;
                Some(Arc::new(master))
            }
            None => None,
        };

        Ok(Self { modbus, mr })
    }

    fn health(&self) -> Vec<LinkHealth> {
        let mut links = Vec::new();
        if let Some(modbus) = &self.modbus {
            links.push(LinkHealth::observe("modbus", modbus));
        }
        if let Some(mr) = &self.mr {
            links.push(LinkHealth::observe("mr", mr));
        }
        links
    }

    /// Stop every engine. Poll tasks must be gone so the handles are unique.
    async fn shutdown(self) {
        if let Some(modbus) = self.modbus {
            log_report("modbus", stop(modbus).await);
        }
        if let Some(mr) = self.mr {
            log_report("mr", stop(mr).await);
        }
    }
}

async fn stop<P: Protocol>(link: Arc<LinkClient<P>>) -> Option<LinkResult<EngineReport>> {
    match Arc::try_unwrap(link) {
        Ok(link) => Some(link.shutdown().await),
        // Dropping the last handle stops the engine without a report
        Err(_) => None,
    }
}

fn log_report(name: &str, report: Option<LinkResult<EngineReport>>) {
    match report {
        Some(Ok(report)) => info!(
            link = name,
            discarded_pending = report.discarded_pending,
            discarded_in_flight = report.discarded_in_flight,
            outstanding_buffers = report.outstanding_buffers,
            "Link stopped"
        ),
        Some(Err(err)) => warn!(link = name, error = %err, "Link engine did not stop cleanly"),
        None => warn!(link = name, "Link still shared at shutdown, dropped"),
    }
}

/// Main daemon run loop.
async fn run_daemon(config: &LinkConfig, args: &Args) -> Result<()> {
    let diagnostics = DiagnosticsState::new();
    let listener = Arc::new(LoggingConfirmation);
    let links = Links::start(config, &listener)?;

    if links.modbus.is_none() && links.mr.is_none() {
        warn!("No [modbus] or [mr] section configured, only waiting for shutdown");
    }

    let mut polls = JoinSet::new();
    if let (Some(modbus), Some(section)) = (&links.modbus, &config.modbus) {
        let confirm: Arc<dyn ModbusConfirmation> = listener.clone();
        for poll in &section.polls {
            polls.spawn(poll_modbus(Arc::clone(modbus), poll.clone(), Arc::clone(&confirm)));
        }
    }
    if let (Some(mr), Some(section)) = (&links.mr, &config.mr) {
        for poll in &section.polls {
            polls.spawn(poll_mr(Arc::clone(mr), poll.clone(), section.tidemark));
        }
    }
    info!(polls = polls.len(), "Links started, entering main loop");

    let mut status = tokio::time::interval(config.diagnostics.status_interval);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate
    status.tick().await;

    let shutdown = wait_for_shutdown(args.max_runtime);
    tokio::pin!(shutdown);
    let reason = loop {
        tokio::select! {
            reason = &mut shutdown => {
                break reason.context("Failed to set up signal handlers")?;
            }
            _ = status.tick() => {
                log_status(&links.health(), &diagnostics, config.diagnostics.prometheus);
            }
        }
    };

    info!(%reason, "Shutting down...");
    polls.shutdown().await;

    let final_health = links.health();
    log_status(&final_health, &diagnostics, config.diagnostics.prometheus);
    let dumped = match &args.dump_metrics {
        Some(path) => dump_metrics(path, &final_health, &diagnostics),
        None => Ok(()),
    };

    links.shutdown().await;
    info!(
        uptime_secs = diagnostics.uptime().as_secs(),
        "Daemon shutdown complete"
    );
    dumped
}

fn log_status(links: &[LinkHealth], diagnostics: &DiagnosticsState, prometheus: bool) {
    for link in links {
        info!(
            link = %link.name,
            state = %link.state,
            health = %link.health,
            requests = link.metrics.requests,
            replies = link.metrics.replies,
            timeouts = link.metrics.timeouts,
            reconnects = link.metrics.reconnects,
            mean_latency_us = link.metrics.latency.mean_ns.map_or(0, |ns| ns / 1_000),
            "Periodic status"
        );
    }
    if prometheus {
        info!(
            "Prometheus metrics\n{}",
            format_prometheus_metrics(links, diagnostics.uptime())
        );
    }
}

fn dump_metrics(path: &Path, links: &[LinkHealth], diagnostics: &DiagnosticsState) -> Result<()> {
    let document = serde_json::json!({
        "uptime_secs": diagnostics.uptime().as_secs_f64(),
        "links": links.iter().map(LinkHealth::to_json).collect::<Vec<_>>(),
    });
    let text = serde_json::to_string_pretty(&document).context("Failed to encode metrics")?;
    std::fs::write(path, text).with_context(|| format!("Failed to write metrics to {path:?}"))?;
    info!(?path, "Metrics snapshot written");
    Ok(())
}

/// Issue one Modbus read per interval while the link is up.
async fn poll_modbus(
    client: Arc<ModbusClient>,
    poll: ModbusPoll,
    confirm: Arc<dyn ModbusConfirmation>,
) {
    let mut ticker = tokio::time::interval(poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !client.is_connected() {
            trace!(?poll.kind, "link down, poll skipped");
            continue;
        }

        let confirm = Some(Arc::clone(&confirm));
        let issued = match poll.kind {
            ModbusPollKind::Coils => client.read_coils(poll.address, poll.quantity, confirm),
            ModbusPollKind::DiscreteInputs => {
                client.read_discrete_inputs(poll.address, poll.quantity, confirm)
            }
            ModbusPollKind::HoldingRegisters => {
                client.read_holding_registers(poll.address, poll.quantity, confirm)
            }
            ModbusPollKind::InputRegisters => {
                client.read_input_registers(poll.address, poll.quantity, confirm)
            }
        };
        if !keep_polling(issued) {
            break;
        }
    }
}

/// Issue one read-all-signal per interval while the link is up.
async fn poll_mr(master: Arc<MrMaster>, poll: MrPoll, tidemark: f32) {
    let mut ticker = tokio::time::interval(poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !master.is_connected() {
            trace!(db = poll.db, "link down, poll skipped");
            continue;
        }
        let issued = master.read_all_signal(poll.db, poll.addr0, poll.addrn, tidemark);
        if !keep_polling(issued) {
            break;
        }
    }
}

fn keep_polling(issued: LinkResult<u16>) -> bool {
    match issued {
        Ok(id) => {
            trace!(id, "poll issued");
            true
        }
        Err(LinkError::Closed) => {
            warn!("link stopped, poll ended");
            false
        }
        Err(err) => {
            warn!(error = %err, "poll rejected");
            true
        }
    }
}

/// Logs every confirmation the daemon receives.
#[derive(Debug)]
struct LoggingConfirmation;

impl ModbusConfirmation for LoggingConfirmation {
    fn on_coils(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {
        debug!(transaction_id, address, count, ?status, "coils");
    }

    fn on_discrete_inputs(&self, transaction_id: u16, address: u16, status: &[u8], count: u16) {
        debug!(transaction_id, address, count, ?status, "discrete inputs");
    }

    fn on_holding_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {
        debug!(transaction_id, address, ?registers, "holding registers");
    }

    fn on_input_registers(&self, transaction_id: u16, address: u16, registers: &[u16]) {
        debug!(transaction_id, address, ?registers, "input registers");
    }

    fn on_echo_response(&self, transaction_id: u16, function_code: u8, address: u16, value: u16) {
        debug!(transaction_id, function_code, address, value, "write confirmed");
    }

    fn on_exception(&self, transaction_id: u16, function_code: u8, reason: u8) {
        match ExceptionCode::from_byte(reason) {
            Some(code) => warn!(transaction_id, function_code, %code, "exception reply"),
            None => warn!(transaction_id, function_code, reason, "exception reply"),
        }
    }

    fn on_failure(&self, transaction_id: u16, function_code: u8, failure: TransactionFailure) {
        warn!(transaction_id, function_code, %failure, "transaction failed");
    }
}

impl MrConfirmation for LoggingConfirmation {
    fn on_all_signals(&self, addr0: u16, addrn: u16, data: &[u8]) {
        debug!(addr0, addrn, len = data.len(), "all signals");
    }

    fn on_realtime_data(&self, data: &[f32]) {
        trace!(?data, "realtime");
    }

    fn on_forat_data(&self, dqs: &[u8], data: &[f32]) {
        trace!(?dqs, ?data, "forat");
    }

    fn on_analog_input_data(&self, data: &[f32]) {
        trace!(?data, "analog inputs");
    }

    fn on_analog_output_data(&self, data: &[f32]) {
        trace!(?data, "analog outputs");
    }

    fn on_digital_input(&self, data: &[u8]) {
        trace!(?data, "digital inputs");
    }

    fn on_raw_digital_output(&self, data: &[u8]) {
        trace!(?data, "digital outputs (raw)");
    }
}
