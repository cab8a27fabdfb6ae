//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM (Ctrl+C only, off Unix) end the daemon, as does an
//! optional maximum runtime. Handlers are installed through `tokio::signal`
//! so the wait is just another future in the main `select!`.

use std::fmt;
use std::io;
use std::time::Duration;
use tracing::{debug, info};

/// Signal types that the daemon handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Why the daemon is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal arrived.
    Signal(SignalKind),
    /// `--max-runtime` elapsed.
    MaxRuntime(Duration),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(kind) => write!(f, "{kind} received"),
            ShutdownReason::MaxRuntime(limit) => {
                write!(f, "maximum runtime of {} reached", humantime::format_duration(*limit))
            }
        }
    }
}

/// Wait for a termination signal, or for `max_runtime` if one is given.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_shutdown(max_runtime: Option<Duration>) -> io::Result<ShutdownReason> {
    let deadline = async {
        match max_runtime {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    let reason = tokio::select! {
        kind = termination_signal() => ShutdownReason::Signal(kind?),
        limit = deadline => ShutdownReason::MaxRuntime(limit),
    };
    info!(%reason, "shutdown requested");
    Ok(reason)
}

#[cfg(unix)]
async fn termination_signal() -> io::Result<SignalKind> {
    use tokio::signal::unix::{signal, SignalKind as UnixSignal};

    let mut terminate = signal(UnixSignal::terminate())?;
    debug!("signal handlers registered");
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| SignalKind::Interrupt),
        _ = terminate.recv() => Ok(SignalKind::Terminate),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> io::Result<SignalKind> {
    debug!("Ctrl+C handler registered");
    tokio::signal::ctrl_c().await?;
    Ok(SignalKind::Interrupt)
}
