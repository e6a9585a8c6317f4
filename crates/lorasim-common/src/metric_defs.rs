//! Metric names and descriptions.
//!
//! Every `metrics::counter!`/`histogram!`/`gauge!` call site takes its name
//! from one of these definitions. All metrics carry a `node` label; extra
//! labels are listed per definition.

use std::fmt;

/// Metric instrument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Unit of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    None,
    Count,
    Microseconds,
    Decibels,
    Joules,
}

/// A metric definition.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: MetricUnit,
    pub description: &'static str,
    /// Labels in addition to `node`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit suffix for display, empty when unitless.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::None => "",
            MetricUnit::Count => "count",
            MetricUnit::Microseconds => "us",
            MetricUnit::Decibels => "dB",
            MetricUnit::Joules => "J",
        }
    }

    /// The `metrics` unit, where the facade has one.
    pub fn recorder_unit(&self) -> Option<metrics::Unit> {
        match self.unit {
            MetricUnit::Count => Some(metrics::Unit::Count),
            MetricUnit::Microseconds => Some(metrics::Unit::Microseconds),
            MetricUnit::None | MetricUnit::Decibels | MetricUnit::Joules => None,
        }
    }
}

const fn def(
    name: &'static str,
    kind: MetricKind,
    unit: MetricUnit,
    description: &'static str,
    labels: &'static [&'static str],
) -> MetricDef {
    MetricDef {
        name,
        kind,
        unit,
        description,
        labels,
    }
}

// ============================================================================
// Device
// ============================================================================

pub const DEVICE_TX_PACKETS: MetricDef = def(
    "lorasim.device.tx_packets",
    MetricKind::Counter,
    MetricUnit::Count,
    "Uplinks put on air, retransmissions included",
    &["mtype"],
);

pub const DEVICE_TX_AIRTIME: MetricDef = def(
    "lorasim.device.tx_airtime",
    MetricKind::Counter,
    MetricUnit::Microseconds,
    "Cumulative uplink time on air",
    &[],
);

pub const DEVICE_DUTY_CYCLE_DEFERRED: MetricDef = def(
    "lorasim.device.duty_cycle_deferred",
    MetricKind::Counter,
    MetricUnit::Count,
    "Transmissions postponed by the duty-cycle ledger",
    &[],
);

pub const DEVICE_RETRANSMISSIONS: MetricDef = def(
    "lorasim.device.retransmissions",
    MetricKind::Counter,
    MetricUnit::Count,
    "Frames re-sent with the same frame counter",
    &[],
);

pub const DEVICE_DOWNLINKS_RECEIVED: MetricDef = def(
    "lorasim.device.downlinks_received",
    MetricKind::Counter,
    MetricUnit::Count,
    "Valid downlinks accepted by the device",
    &["window"],
);

pub const DEVICE_ADR_FALLBACKS: MetricDef = def(
    "lorasim.device.adr_fallbacks",
    MetricKind::Counter,
    MetricUnit::Count,
    "Reverts to configured SF and power after the ADR_ACK back-off",
    &[],
);

pub const DEVICE_ENERGY: MetricDef = def(
    "lorasim.device.energy",
    MetricKind::Gauge,
    MetricUnit::Joules,
    "Energy consumed so far",
    &[],
);

// ============================================================================
// Gateway
// ============================================================================

pub const GATEWAY_RX_PACKETS: MetricDef = def(
    "lorasim.gateway.rx_packets",
    MetricKind::Counter,
    MetricUnit::Count,
    "Uplinks demodulated and forwarded",
    &[],
);

pub const GATEWAY_RX_COLLIDED: MetricDef = def(
    "lorasim.gateway.rx_collided",
    MetricKind::Counter,
    MetricUnit::Count,
    "Receptions destroyed by interference",
    &[],
);

pub const GATEWAY_RX_LOST: MetricDef = def(
    "lorasim.gateway.rx_lost",
    MetricKind::Counter,
    MetricUnit::Count,
    "Receptions that failed the error-rate draw",
    &[],
);

pub const GATEWAY_RX_SNR: MetricDef = def(
    "lorasim.gateway.rx_snr",
    MetricKind::Histogram,
    MetricUnit::Decibels,
    "SNR of tracked receptions",
    &[],
);

pub const GATEWAY_DOWNLINKS: MetricDef = def(
    "lorasim.gateway.downlinks",
    MetricKind::Counter,
    MetricUnit::Count,
    "Downlinks transmitted",
    &[],
);

// ============================================================================
// Network server
// ============================================================================

pub const SERVER_DELIVERED: MetricDef = def(
    "lorasim.server.delivered",
    MetricKind::Counter,
    MetricUnit::Count,
    "Uplinks accepted after deduplication",
    &[],
);

pub const SERVER_DUPLICATES: MetricDef = def(
    "lorasim.server.duplicates",
    MetricKind::Counter,
    MetricUnit::Count,
    "Uplink copies merged or discarded by deduplication",
    &[],
);

pub const SERVER_SECURITY_REJECTED: MetricDef = def(
    "lorasim.server.security_rejected",
    MetricKind::Counter,
    MetricUnit::Count,
    "Frames dropped by MIC, decryption or counter checks",
    &["reason"],
);

pub const SERVER_ADR_COMMANDS: MetricDef = def(
    "lorasim.server.adr_commands",
    MetricKind::Counter,
    MetricUnit::Count,
    "LinkADRReq commands queued",
    &[],
);

pub const SERVER_JOINS: MetricDef = def(
    "lorasim.server.joins",
    MetricKind::Counter,
    MetricUnit::Count,
    "Join requests accepted",
    &[],
);

pub const SERVER_GATEWAY_COUNT: MetricDef = def(
    "lorasim.server.gateway_count",
    MetricKind::Histogram,
    MetricUnit::Count,
    "Gateways that heard each delivered uplink",
    &[],
);

// ============================================================================
// Simulation
// ============================================================================

pub const SIMULATION_EVENTS: MetricDef = def(
    "lorasim.simulation.events",
    MetricKind::Counter,
    MetricUnit::Count,
    "Events dispatched by the event loop",
    &["kind"],
);

/// All metric definitions.
pub const ALL: &[MetricDef] = &[
    DEVICE_TX_PACKETS,
    DEVICE_TX_AIRTIME,
    DEVICE_DUTY_CYCLE_DEFERRED,
    DEVICE_RETRANSMISSIONS,
    DEVICE_ADR_FALLBACKS,
    DEVICE_DOWNLINKS_RECEIVED,
    DEVICE_ENERGY,
    GATEWAY_RX_PACKETS,
    GATEWAY_RX_COLLIDED,
    GATEWAY_RX_LOST,
    GATEWAY_RX_SNR,
    GATEWAY_DOWNLINKS,
    SERVER_DELIVERED,
    SERVER_DUPLICATES,
    SERVER_SECURITY_REJECTED,
    SERVER_ADR_COMMANDS,
    SERVER_JOINS,
    SERVER_GATEWAY_COUNT,
    SIMULATION_EVENTS,
];

/// Register descriptions for every metric with the installed recorder.
pub fn describe_all() {
    for m in ALL {
        match (m.kind, m.recorder_unit()) {
            (MetricKind::Counter, Some(unit)) => metrics::describe_counter!(m.name, unit, m.description),
            (MetricKind::Counter, None) => metrics::describe_counter!(m.name, m.description),
            (MetricKind::Gauge, Some(unit)) => metrics::describe_gauge!(m.name, unit, m.description),
            (MetricKind::Gauge, None) => metrics::describe_gauge!(m.name, m.description),
            (MetricKind::Histogram, Some(unit)) => metrics::describe_histogram!(m.name, unit, m.description),
            (MetricKind::Histogram, None) => metrics::describe_histogram!(m.name, m.description),
        }
    }
}

/// Label set carrying only the node name.
pub fn node_labels(node: &str) -> [(&'static str, String); 1] {
    [("node", node.to_string())]
}
