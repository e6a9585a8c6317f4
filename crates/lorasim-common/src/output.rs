//! Output event stream produced by a simulation run.
//!
//! Entities record outputs through [`crate::SimContext::emit`]; the event loop
//! collects them in dispatch order.

use crate::SimTime;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutputKind {
    /// Uplink accepted by the network server (after deduplication).
    Delivered,
    /// Reception destroyed by interference at a gateway.
    Collided,
    /// Reception failed the error-rate draw or reached no gateway.
    Lost,
    /// Transmission postponed by the duty-cycle ledger.
    DutyCycleDeferred,
    /// Downlink carrying a LinkADRReq was scheduled.
    AdrCommandSent,
    /// Device accepted a JoinAccept.
    Joined,
    /// Join server refused a JoinRequest.
    JoinRejected,
    /// Frame dropped by MIC, decryption or counter checks.
    SecurityRejected,
    /// Device received a valid downlink.
    DownlinkReceived,
    /// Frame re-sent with the same frame counter.
    Retransmitted,
    /// Device ran out of battery and stopped.
    BatteryDepleted,
    /// Device heard nothing for ADR_ACK_LIMIT + ADR_ACK_DELAY uplinks and
    /// went back to its configured SF and power.
    AdrFallback,
}

impl OutputKind {
    /// Snake-case label for metrics and stats.
    pub fn as_label(self) -> &'static str {
        match self {
            OutputKind::Delivered => "delivered",
            OutputKind::Collided => "collided",
            OutputKind::Lost => "lost",
            OutputKind::DutyCycleDeferred => "duty_cycle_deferred",
            OutputKind::AdrCommandSent => "adr_command_sent",
            OutputKind::Joined => "joined",
            OutputKind::JoinRejected => "join_rejected",
            OutputKind::SecurityRejected => "security_rejected",
            OutputKind::DownlinkReceived => "downlink_received",
            OutputKind::Retransmitted => "retransmitted",
            OutputKind::BatteryDepleted => "battery_depleted",
            OutputKind::AdrFallback => "adr_fallback",
        }
    }
}

/// One record of the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Simulation time in microseconds.
    pub time: SimTime,
    /// Event kind.
    pub kind: OutputKind,
    /// Device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Gateway name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Uplink or downlink frame counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcnt: Option<u32>,
    /// Spreading factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sf: Option<u8>,
    /// SNR in dB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_db: Option<f64>,
    /// RSSI in dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<f64>,
    /// TX power in dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power_dbm: Option<f64>,
    /// Time on air in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airtime_s: Option<f64>,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OutputEvent {
    /// Start an output record.
    pub fn new(time: SimTime, kind: OutputKind) -> Self {
        OutputEvent {
            time,
            kind,
            device: None,
            gateway: None,
            fcnt: None,
            sf: None,
            snr_db: None,
            rssi_dbm: None,
            tx_power_dbm: None,
            airtime_s: None,
            detail: None,
        }
    }

    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.device = Some(name.into());
        self
    }

    pub fn gateway(mut self, name: impl Into<String>) -> Self {
        self.gateway = Some(name.into());
        self
    }

    pub fn fcnt(mut self, fcnt: u32) -> Self {
        self.fcnt = Some(fcnt);
        self
    }

    pub fn sf(mut self, sf: u8) -> Self {
        self.sf = Some(sf);
        self
    }

    /// Attach RSSI and SNR.
    pub fn signal(mut self, rssi_dbm: f64, snr_db: f64) -> Self {
        self.rssi_dbm = Some(rssi_dbm);
        self.snr_db = Some(snr_db);
        self
    }

    pub fn snr(mut self, snr_db: f64) -> Self {
        self.snr_db = Some(snr_db);
        self
    }

    pub fn tx_power(mut self, dbm: f64) -> Self {
        self.tx_power_dbm = Some(dbm);
        self
    }

    pub fn airtime(mut self, airtime: SimTime) -> Self {
        self.airtime_s = Some(airtime.as_secs_f64());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let ev = OutputEvent::new(SimTime::from_millis(5), OutputKind::Delivered)
            .device("dev-1")
            .gateway("gw-1")
            .fcnt(3)
            .sf(9)
            .signal(-110.0, 2.5)
            .airtime(SimTime::from_millis(185));
        assert_eq!(ev.device.as_deref(), Some("dev-1"));
        assert_eq!(ev.gateway.as_deref(), Some("gw-1"));
        assert_eq!(ev.fcnt, Some(3));
        assert_eq!(ev.snr_db, Some(2.5));
        assert!((ev.airtime_s.unwrap() - 0.185).abs() < 1e-9);
    }

    #[test]
    fn test_kind_labels_unique() {
        let kinds = [
            OutputKind::Delivered,
            OutputKind::Collided,
            OutputKind::Lost,
            OutputKind::DutyCycleDeferred,
            OutputKind::AdrCommandSent,
            OutputKind::Joined,
            OutputKind::JoinRejected,
            OutputKind::SecurityRejected,
            OutputKind::DownlinkReceived,
            OutputKind::Retransmitted,
            OutputKind::BatteryDepleted,
            OutputKind::AdrFallback,
        ];
        let labels: std::collections::BTreeSet<_> = kinds.iter().map(|k| k.as_label()).collect();
        assert_eq!(labels.len(), kinds.len());
    }
}
