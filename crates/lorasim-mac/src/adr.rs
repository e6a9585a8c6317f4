//! Adaptive data rate: the server-side algorithm and the device-side
//! ADR_ACK back-off.

use lorasim_phy::{LoraPhyConfig, MAX_SF, MIN_SF};
use lorawan_packet::region::MAX_TX_POWER_INDEX;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How the SNR history is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdrMethod {
    #[default]
    Max,
    Avg,
}

/// Server ADR parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdrConfig {
    pub method: AdrMethod,
    /// Installation margin in dB.
    pub margin_db: f64,
    /// Samples needed before a decision.
    pub history_len: usize,
    /// Demodulation floor per SF.
    pub required_snr: [f64; 6],
}

impl Default for AdrConfig {
    fn default() -> Self {
        AdrConfig {
            method: AdrMethod::Max,
            margin_db: 10.0,
            history_len: 20,
            required_snr: LoraPhyConfig::DEFAULT_SNR_THRESHOLDS,
        }
    }
}

/// New SF and TX power index for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrDecision {
    pub spreading_factor: u8,
    pub tx_power_index: u8,
}

/// Bounded SNR history of one device.
#[derive(Debug, Clone, Default)]
pub struct SnrHistory {
    samples: VecDeque<f64>,
}

impl SnrHistory {
    pub fn push(&mut self, snr_db: f64, capacity: usize) {
        self.samples.push_back(snr_db);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn reduce(&self, method: AdrMethod) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(match method {
            AdrMethod::Max => self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AdrMethod::Avg => self.samples.iter().sum::<f64>() / self.samples.len() as f64,
        })
    }
}

/// Run the ADR algorithm. Returns a decision only when SF or power changes.
pub fn evaluate(config: &AdrConfig, history: &SnrHistory, spreading_factor: u8, tx_power_index: u8) -> Option<AdrDecision> {
    if history.len() < config.history_len {
        return None;
    }
    let snr_m = history.reduce(config.method)?;
    let sf_idx = spreading_factor.clamp(MIN_SF, MAX_SF) - MIN_SF;
    let required = config.required_snr[sf_idx as usize];
    let margin = snr_m - required - config.margin_db;
    let mut nstep = (margin / 3.0).round() as i32;

    let mut sf = spreading_factor;
    let mut power = tx_power_index;
    while nstep > 0 && sf > MIN_SF {
        sf -= 1;
        nstep -= 1;
    }
    while nstep > 0 && power < MAX_TX_POWER_INDEX {
        power += 1;
        nstep -= 1;
    }
    while nstep < 0 && power > 0 {
        power -= 1;
        nstep += 1;
    }
    while nstep < 0 && sf < MAX_SF {
        sf += 1;
        nstep += 1;
    }

    if sf == spreading_factor && power == tx_power_index {
        None
    } else {
        Some(AdrDecision {
            spreading_factor: sf,
            tx_power_index: power,
        })
    }
}

// ============================================================================
// Device-side ADR_ACK
// ============================================================================

/// Default uplinks without downlink before ADRACKReq is set.
pub const ADR_ACK_LIMIT: u32 = 64;
/// Default further uplinks before the device falls back to its configured
/// data rate and power.
pub const ADR_ACK_DELAY: u32 = 32;

/// What the device must do for the uplink being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrAckStep {
    /// Set the ADRACKReq bit on this uplink.
    pub ack_req: bool,
    /// Revert to default data rate and power after this uplink.
    pub revert: bool,
}

/// ADR_ACK_CNT bookkeeping.
#[derive(Debug, Clone)]
pub struct AdrAckCounter {
    count: u32,
    limit: u32,
    delay: u32,
}

impl Default for AdrAckCounter {
    fn default() -> Self {
        AdrAckCounter {
            count: 0,
            limit: ADR_ACK_LIMIT,
            delay: ADR_ACK_DELAY,
        }
    }
}

impl AdrAckCounter {
    pub fn new(limit: u32, delay: u32) -> Self {
        AdrAckCounter { count: 0, limit, delay }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// New limit and delay from an ADRParamSetupReq. The running count is
    /// kept, so a lowered limit can trigger on the very next uplink.
    pub fn set_params(&mut self, limit: u32, delay: u32) {
        self.limit = limit;
        self.delay = delay;
    }

    /// Count one uplink.
    pub fn on_uplink(&mut self) -> AdrAckStep {
        self.count += 1;
        let ack_req = self.count >= self.limit;
        let revert = self.count >= self.limit + self.delay;
        if revert {
            self.count = 0;
        }
        AdrAckStep { ack_req, revert }
    }

    /// Any downlink resets the counter.
    pub fn on_downlink(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_history(snr: f64) -> SnrHistory {
        let mut h = SnrHistory::default();
        for _ in 0..20 {
            h.push(snr, 20);
        }
        h
    }

    #[test]
    fn test_needs_full_history() {
        let cfg = AdrConfig::default();
        let mut h = SnrHistory::default();
        for _ in 0..19 {
            h.push(10.0, 20);
        }
        assert_eq!(evaluate(&cfg, &h, 12, 0), None);
    }

    #[test]
    fn test_margin_lowers_sf() {
        let cfg = AdrConfig::default();
        // 15 dB above the SF12 floor: margin 5 dB, two steps.
        let h = full_history(-5.0);
        let d = evaluate(&cfg, &h, 12, 0).unwrap();
        assert_eq!(d.spreading_factor, 10);
        assert_eq!(d.tx_power_index, 0);
        // Same link quality after the change: no further step.
        assert_eq!(evaluate(&cfg, &h, 10, 0), None);
    }

    #[test]
    fn test_excess_margin_reduces_power_at_sf7() {
        let cfg = AdrConfig::default();
        let h = full_history(30.0);
        let d = evaluate(&cfg, &h, 7, 0).unwrap();
        assert_eq!(d.spreading_factor, 7);
        assert_eq!(d.tx_power_index, MAX_TX_POWER_INDEX);
        assert_eq!(evaluate(&cfg, &h, 7, MAX_TX_POWER_INDEX), None);
    }

    #[test]
    fn test_negative_margin_raises_power_then_sf() {
        let cfg = AdrConfig::default();
        let h = full_history(-20.0);
        // margin -22.5 at SF7 => nstep -8 (round half away from zero)
        let d = evaluate(&cfg, &h, 7, 2).unwrap();
        assert_eq!(d.tx_power_index, 0);
        assert_eq!(d.spreading_factor, 12);
    }

    #[test]
    fn test_avg_method() {
        let cfg = AdrConfig {
            method: AdrMethod::Avg,
            ..AdrConfig::default()
        };
        let mut h = SnrHistory::default();
        for i in 0..20 {
            h.push(if i % 2 == 0 { 0.0 } else { -10.0 }, 20);
        }
        // avg -5 => same as the max test above
        assert_eq!(evaluate(&cfg, &h, 12, 0).map(|d| d.spreading_factor), Some(10));
    }

    #[test]
    fn test_adr_ack_counter_sequence() {
        let mut c = AdrAckCounter::default();
        let steps: Vec<AdrAckStep> = (0..100).map(|_| c.on_uplink()).collect();
        assert!(!steps[62].ack_req);
        assert!(steps[63].ack_req);
        let reverts: Vec<usize> = steps.iter().enumerate().filter(|(_, s)| s.revert).map(|(i, _)| i).collect();
        assert_eq!(reverts, vec![95]);
        // counting restarts after the revert
        assert!(!steps[96].ack_req);
        c.on_downlink();
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn test_adr_ack_counter_custom_params() {
        let mut c = AdrAckCounter::new(8, 4);
        let steps: Vec<AdrAckStep> = (0..24).map(|_| c.on_uplink()).collect();
        let first_req = steps.iter().position(|s| s.ack_req);
        assert_eq!(first_req, Some(7));
        let reverts: Vec<usize> = steps.iter().enumerate().filter(|(_, s)| s.revert).map(|(i, _)| i).collect();
        assert_eq!(reverts, vec![11, 23]);

        c.set_params(2, 1);
        assert_eq!((c.limit(), c.delay()), (2, 1));
        assert!(!c.on_uplink().ack_req);
        let step = c.on_uplink();
        assert!(step.ack_req && !step.revert);
        assert!(c.on_uplink().revert);
    }
}
