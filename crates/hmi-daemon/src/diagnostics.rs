//! Link health and metrics export for the daemon.
//!
//! Turns each link's connection state and counters into a health verdict,
//! a status log line and Prometheus text exposition format.

use hmi_common::{ConnectionState, LinkMetricsSnapshot};
use hmi_plcio::{LinkClient, Protocol};
use serde_json::json;
use std::fmt::{self, Write};
use std::time::{Duration, Instant};

/// Failed replies above this share of answered transactions degrade a link.
const DEGRADED_FAILURE_RATIO: f64 = 0.01;

/// Health status of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected and answering.
    Healthy,
    /// Connected with too many failures, or reconnecting.
    Degraded,
    /// Circuit open.
    Unhealthy,
    /// Never connected yet.
    Starting,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
        }
    }
}

/// Determine health from connection state and counters.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn health_from_state(state: ConnectionState, metrics: &LinkMetricsSnapshot) -> HealthStatus {
    match state {
        ConnectionState::Failed => HealthStatus::Unhealthy,
        ConnectionState::Disconnected | ConnectionState::Connecting => {
            if metrics.connects == 0 {
                HealthStatus::Starting
            } else {
                HealthStatus::Degraded
            }
        }
        ConnectionState::Connected => {
            let failed = metrics.timeouts + metrics.framing_faults + metrics.function_mismatches;
            let answered = metrics.replies + metrics.timeouts;
            if answered > 0 && failed as f64 / answered as f64 > DEGRADED_FAILURE_RATIO {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
    }
}

/// Snapshot of one link at a point in time.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    /// Link name (`modbus` or `mr`).
    pub name: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Derived health.
    pub health: HealthStatus,
    /// Counters and latency.
    pub metrics: LinkMetricsSnapshot,
}

impl LinkHealth {
    /// Observe a running link.
    #[must_use]
    pub fn observe<P: Protocol>(name: &str, link: &LinkClient<P>) -> Self {
        Self::new(name, link.state(), link.metrics().snapshot())
    }

    /// Build from already captured values.
    #[must_use]
    pub fn new(name: &str, state: ConnectionState, metrics: LinkMetricsSnapshot) -> Self {
        Self {
            name: name.to_string(),
            state,
            health: health_from_state(state, &metrics),
            metrics,
        }
    }

    /// JSON form used by `--dump-metrics`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "state": self.state,
            "health": self.health.to_string(),
            "metrics": self.metrics,
        })
    }
}

/// Tracks daemon uptime.
#[derive(Debug)]
pub struct DiagnosticsState {
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Start the uptime clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Time since the daemon started.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Format link metrics in Prometheus text exposition format.
#[must_use]
pub fn format_prometheus_metrics(links: &[LinkHealth], uptime: Duration) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# HELP hmi_uptime_seconds Daemon uptime in seconds");
    let _ = writeln!(output, "# TYPE hmi_uptime_seconds gauge");
    let _ = writeln!(output, "hmi_uptime_seconds {:.3}", uptime.as_secs_f64());

    let _ = writeln!(
        output,
        "# HELP hmi_link_health Link health status (1=healthy, 0=not healthy)"
    );
    let _ = writeln!(output, "# TYPE hmi_link_health gauge");
    for link in links {
        let _ = writeln!(
            output,
            "hmi_link_health{{link=\"{}\",status=\"{}\"}} {}",
            link.name,
            link.health,
            u8::from(link.health == HealthStatus::Healthy)
        );
    }

    let _ = writeln!(output, "# HELP hmi_link_connected Link transport status");
    let _ = writeln!(output, "# TYPE hmi_link_connected gauge");
    for link in links {
        let _ = writeln!(
            output,
            "hmi_link_connected{{link=\"{}\",state=\"{}\"}} {}",
            link.name,
            link.state,
            u8::from(link.state.is_connected())
        );
    }

    let counters: [(&str, &str, fn(&LinkMetricsSnapshot) -> u64); 11] = [
        ("requests", "Requests issued", |m| m.requests),
        ("frames_sent", "Frames written to the transport", |m| m.frames_sent),
        ("replies", "Reply frames dispatched", |m| m.replies),
        ("exceptions", "Exception replies", |m| m.exceptions),
        ("correlation_misses", "Replies matching no transaction", |m| {
            m.correlation_misses
        }),
        ("framing_faults", "Frames discarded for bad markers", |m| {
            m.framing_faults
        }),
        ("function_mismatches", "Replies with the wrong function code", |m| {
            m.function_mismatches
        }),
        ("timeouts", "Transactions timed out", |m| m.timeouts),
        ("reconnects", "Transport faults followed by reconnect", |m| {
            m.reconnects
        }),
        ("connect_failures", "Failed connect attempts", |m| {
            m.connect_failures
        }),
        ("discarded_bytes", "Reply bytes discarded", |m| m.discarded_bytes),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(output, "# HELP hmi_link_{name}_total {help}");
        let _ = writeln!(output, "# TYPE hmi_link_{name}_total counter");
        for link in links {
            let _ = writeln!(
                output,
                "hmi_link_{name}_total{{link=\"{}\"}} {}",
                link.name,
                value(&link.metrics)
            );
        }
    }

    let _ = writeln!(
        output,
        "# HELP hmi_link_latency_seconds Request to reply latency"
    );
    let _ = writeln!(output, "# TYPE hmi_link_latency_seconds gauge");
    for link in links {
        let latency = &link.metrics.latency;
        for (stat, ns) in [
            ("min", latency.min_ns),
            ("mean", latency.mean_ns),
            ("p99", latency.p99_ns),
            ("max", latency.max_ns),
        ] {
            if let Some(ns) = ns {
                let _ = writeln!(
                    output,
                    "hmi_link_latency_seconds{{link=\"{}\",stat=\"{stat}\"}} {:.9}",
                    link.name,
                    Duration::from_nanos(ns).as_secs_f64()
                );
            }
        }
    }

    output
}
