//! Link budget evaluation and packet error models.

use crate::propagation::{self, CorrelatedFading, Environment};
use crate::{bit_rate, validate_sf, LoraPhyConfig, MIN_SF};
use lorasim_common::{ConfigError, Position};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// Error Models
// ============================================================================

/// Maps link quality to a packet error probability.
///
/// Implementations must be monotonically non-increasing in SNR and return 1
/// below the demodulation floor of the spreading factor.
pub trait ErrorModel: Send + Sync + std::fmt::Debug {
    /// Probability in 0..=1 that a frame of `payload_bytes` is lost.
    fn packet_error_rate(&self, snr_db: f64, spreading_factor: u8, payload_bytes: usize) -> f64;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

fn threshold(thresholds: &[f64; 6], sf: u8) -> f64 {
    let idx = sf.clamp(MIN_SF, MIN_SF + 5) - MIN_SF;
    thresholds[idx as usize]
}

/// Logistic approximation of the FLoRa PER curves.
#[derive(Debug, Clone)]
pub struct LogisticErrorModel {
    thresholds: [f64; 6],
}

impl LogisticErrorModel {
    pub fn new(phy: &LoraPhyConfig) -> Self {
        LogisticErrorModel {
            thresholds: phy.snr_thresholds,
        }
    }
}

impl ErrorModel for LogisticErrorModel {
    fn packet_error_rate(&self, snr_db: f64, spreading_factor: u8, _payload_bytes: usize) -> f64 {
        let th = threshold(&self.thresholds, spreading_factor);
        if snr_db < th {
            return 1.0;
        }
        1.0 / (1.0 + (2.0 * (snr_db - (th + 2.0))).exp())
    }

    fn name(&self) -> &'static str {
        "logistic"
    }
}

/// Bit error integral of LoRa chirp demodulation, turned into a frame error rate.
#[derive(Debug, Clone)]
pub struct PreciseErrorModel {
    thresholds: [f64; 6],
    bandwidth_hz: u32,
    coding_rate: u8,
}

impl PreciseErrorModel {
    pub fn new(phy: &LoraPhyConfig, bandwidth_hz: u32, coding_rate: u8) -> Self {
        PreciseErrorModel {
            thresholds: phy.snr_thresholds,
            bandwidth_hz,
            coding_rate,
        }
    }

    /// Bit error rate for a linear SINR.
    pub fn bit_error_rate(&self, snir: f64, spreading_factor: u8) -> f64 {
        let bitrate = bit_rate(spreading_factor, self.bandwidth_hz, self.coding_rate);
        let dsnr = 20.0 * snir * self.bandwidth_hz as f64 / bitrate;
        let mut sum = 0.0;
        let mut binom = 1.0f64;
        // binom tracks C(16, k)
        for k in 1..=16u32 {
            binom = binom * (16 - k + 1) as f64 / k as f64;
            if k < 2 {
                continue;
            }
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sum += sign * binom * (dsnr * (1.0 / k as f64 - 1.0)).exp();
        }
        ((8.0 / 15.0) * (1.0 / 16.0) * sum).clamp(0.0, 0.5)
    }
}

impl ErrorModel for PreciseErrorModel {
    fn packet_error_rate(&self, snr_db: f64, spreading_factor: u8, payload_bytes: usize) -> f64 {
        if snr_db < threshold(&self.thresholds, spreading_factor) {
            return 1.0;
        }
        let snir = 10f64.powf(snr_db / 10.0);
        let ber = self.bit_error_rate(snir, spreading_factor);
        let bits = (payload_bytes * 8) as i32;
        (1.0 - (1.0 - ber).powi(bits)).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "precise"
    }
}

/// Which packet error model a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorModelKind {
    #[default]
    Logistic,
    Precise,
    /// Externally supplied backend; falls back to logistic when absent.
    Accelerated,
}

/// Resolve the configured error model.
pub fn select_error_model(
    kind: ErrorModelKind,
    accelerated: Option<Arc<dyn ErrorModel>>,
    phy: &LoraPhyConfig,
    bandwidth_hz: u32,
    coding_rate: u8,
) -> Arc<dyn ErrorModel> {
    match kind {
        ErrorModelKind::Logistic => Arc::new(LogisticErrorModel::new(phy)),
        ErrorModelKind::Precise => Arc::new(PreciseErrorModel::new(phy, bandwidth_hz, coding_rate)),
        ErrorModelKind::Accelerated => match accelerated {
            Some(backend) => backend,
            None => {
                warn!("Accelerated error model requested but no backend registered, using logistic");
                Arc::new(LogisticErrorModel::new(phy))
            }
        },
    }
}

// ============================================================================
// Link Evaluator
// ============================================================================

/// Antenna gains and losses applied to every link.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AntennaGains {
    #[serde(default)]
    pub tx_gain_dbi: f64,
    #[serde(default)]
    pub rx_gain_dbi: f64,
    #[serde(default)]
    pub cable_loss_db: f64,
}

/// One evaluated link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSample {
    pub distance_m: f64,
    pub path_loss_db: f64,
    pub shadowing_db: f64,
    /// Fading attenuation (positive means weaker).
    pub fading_db: f64,
    pub rssi_dbm: f64,
    pub snr_db: f64,
    pub packet_error_rate: f64,
}

/// Computes RSSI, SNR and PER between two positions.
#[derive(Debug, Clone)]
pub struct LinkEvaluator {
    environment: Environment,
    gains: AntennaGains,
    noise_floor_dbm: f64,
    multipath_taps: u32,
    error_model: Arc<dyn ErrorModel>,
}

impl LinkEvaluator {
    pub fn new(
        environment: Environment,
        gains: AntennaGains,
        noise_floor_dbm: f64,
        multipath_taps: u32,
        error_model: Arc<dyn ErrorModel>,
    ) -> Result<Self, ConfigError> {
        environment.validate()?;
        if !noise_floor_dbm.is_finite() {
            return Err(ConfigError::invalid("noise_floor_dbm", "must be finite"));
        }
        Ok(LinkEvaluator {
            environment,
            gains,
            noise_floor_dbm,
            multipath_taps,
            error_model,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn noise_floor_dbm(&self) -> f64 {
        self.noise_floor_dbm
    }

    pub fn error_model(&self) -> &Arc<dyn ErrorModel> {
        &self.error_model
    }

    /// Evaluate one transmission over one link.
    ///
    /// Draws shadowing, multipath and (when given) advances the link's
    /// correlated fading process, in that order.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate<R: Rng>(
        &self,
        tx_pos: &Position,
        rx_pos: &Position,
        tx_power_dbm: f64,
        spreading_factor: u8,
        payload_bytes: usize,
        fading: Option<&mut CorrelatedFading>,
        rng: &mut R,
    ) -> Result<LinkSample, ConfigError> {
        validate_sf(spreading_factor)?;
        let distance_m = tx_pos.distance_to(rx_pos);
        let path_loss_db = propagation::path_loss(distance_m, &self.environment)?;
        let shadowing_db = propagation::shadowing_sample(rng, &self.environment);
        let multipath_db = propagation::fading_sample(rng, self.multipath_taps);
        let correlated_db = fading.map(|f| f.next(rng)).unwrap_or(0.0);
        let fading_db = correlated_db - multipath_db;

        let rssi_dbm = tx_power_dbm + self.gains.tx_gain_dbi + self.gains.rx_gain_dbi
            - self.gains.cable_loss_db
            - path_loss_db
            - shadowing_db
            - fading_db;
        let snr_db = rssi_dbm - self.noise_floor_dbm;
        let packet_error_rate = self
            .error_model
            .packet_error_rate(snr_db, spreading_factor, payload_bytes)
            .clamp(0.0, 1.0);

        Ok(LinkSample {
            distance_m,
            path_loss_db,
            shadowing_db,
            fading_db,
            rssi_dbm,
            snr_db,
            packet_error_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn deterministic_env() -> Environment {
        Environment {
            shadowing_std_db: 0.0,
            ..Environment::URBAN
        }
    }

    fn evaluator(kind: ErrorModelKind) -> LinkEvaluator {
        let phy = LoraPhyConfig::default();
        let model = select_error_model(kind, None, &phy, 125_000, 1);
        LinkEvaluator::new(deterministic_env(), AntennaGains::default(), -117.0, 1, model).unwrap()
    }

    #[test]
    fn test_logistic_extremes() {
        let m = LogisticErrorModel::new(&LoraPhyConfig::default());
        assert_eq!(m.packet_error_rate(-30.0, 7, 20), 1.0);
        assert!(m.packet_error_rate(20.0, 7, 20) < 1e-9);
        // Just above threshold the curve is still near one.
        assert!(m.packet_error_rate(-7.4, 7, 20) > 0.9);
    }

    #[test]
    fn test_precise_extremes() {
        let m = PreciseErrorModel::new(&LoraPhyConfig::default(), 125_000, 1);
        assert_eq!(m.packet_error_rate(-25.0, 12, 20), 1.0);
        assert!(m.packet_error_rate(10.0, 12, 20) < 1e-6);
        assert!(m.packet_error_rate(10.0, 7, 20) < 1e-6);
    }

    #[test]
    fn test_precise_ber_at_zero_snr_is_half() {
        let m = PreciseErrorModel::new(&LoraPhyConfig::default(), 125_000, 1);
        assert!((m.bit_error_rate(0.0, 7) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_accelerated_without_backend_falls_back() {
        let phy = LoraPhyConfig::default();
        let model = select_error_model(ErrorModelKind::Accelerated, None, &phy, 125_000, 1);
        assert_eq!(model.name(), "logistic");
    }

    #[test]
    fn test_evaluate_link_budget() {
        let ev = evaluator(ErrorModelKind::Logistic);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let s = ev
            .evaluate(&Position::new(0.0, 0.0), &Position::new(40.0, 0.0), 14.0, 7, 20, None, &mut rng)
            .unwrap();
        assert!((s.rssi_dbm - (14.0 - 127.41)).abs() < 1e-9);
        assert!((s.snr_db - (14.0 - 127.41 + 117.0)).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_rejects_bad_sf() {
        let ev = evaluator(ErrorModelKind::Logistic);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = ev.evaluate(&Position::new(0.0, 0.0), &Position::new(1.0, 0.0), 14.0, 13, 20, None, &mut rng);
        assert_eq!(err, Err(ConfigError::InvalidSpreadingFactor(13)));
    }

    proptest! {
        #[test]
        fn test_logistic_monotonic(a in -40.0f64..30.0, b in -40.0f64..30.0, sf in 7u8..=12) {
            let m = LogisticErrorModel::new(&LoraPhyConfig::default());
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(m.packet_error_rate(hi, sf, 20) <= m.packet_error_rate(lo, sf, 20));
        }
    }
}
