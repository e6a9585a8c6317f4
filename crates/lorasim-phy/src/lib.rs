//! # lorasim-phy
//!
//! LoRa physical layer for the LoRaWAN network simulator.
//!
//! This crate provides:
//! - PHY constants and time on air ([`LoraPhyConfig`], [`time_on_air`])
//! - Propagation: path loss, shadowing, noise, fading ([`propagation`])
//! - Link evaluation and packet error models ([`link`])
//! - Interference and capture decisions ([`collision`])
//! - The shared radio medium entity ([`Medium`])

pub mod collision;
pub mod link;
pub mod medium;
pub mod propagation;

use lorasim_common::{ConfigError, RadioParams, SimTime};
use serde::{Deserialize, Serialize};

pub use collision::{CollisionConfig, CollisionOutcome, CollisionResolver, ReceptionSnapshot};
pub use link::{select_error_model, AntennaGains, ErrorModel, ErrorModelKind, LinkEvaluator, LinkSample};
pub use medium::{FadingConfig, Medium, RadioSite, SiteRole};
pub use propagation::{CorrelatedFading, Environment};

// ============================================================================
// PHY Calculations
// ============================================================================

/// Lowest valid spreading factor.
pub const MIN_SF: u8 = 7;
/// Highest valid spreading factor.
pub const MAX_SF: u8 = 12;

/// Configurable LoRa PHY constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoraPhyConfig {
    /// Number of programmed preamble symbols.
    #[serde(default = "default_preamble_symbols")]
    pub preamble_symbols: u32,
    /// Demodulation SNR floor for SF 7-12, indexed as [SF-7].
    #[serde(default = "default_snr_thresholds")]
    pub snr_thresholds: [f64; 6],
}

fn default_preamble_symbols() -> u32 {
    LoraPhyConfig::DEFAULT_PREAMBLE_SYMBOLS
}

fn default_snr_thresholds() -> [f64; 6] {
    LoraPhyConfig::DEFAULT_SNR_THRESHOLDS
}

impl LoraPhyConfig {
    /// Default preamble symbol count.
    pub const DEFAULT_PREAMBLE_SYMBOLS: u32 = 8;

    /// Default SNR thresholds for SF 7-12.
    pub const DEFAULT_SNR_THRESHOLDS: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

    /// SNR threshold for a spreading factor.
    pub fn snr_threshold(&self, spreading_factor: u8) -> Result<f64, ConfigError> {
        validate_sf(spreading_factor)?;
        Ok(self.snr_thresholds[(spreading_factor - MIN_SF) as usize])
    }
}

impl Default for LoraPhyConfig {
    fn default() -> Self {
        Self {
            preamble_symbols: Self::DEFAULT_PREAMBLE_SYMBOLS,
            snr_thresholds: Self::DEFAULT_SNR_THRESHOLDS,
        }
    }
}

/// Reject spreading factors outside 7..=12.
pub fn validate_sf(spreading_factor: u8) -> Result<(), ConfigError> {
    if (MIN_SF..=MAX_SF).contains(&spreading_factor) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSpreadingFactor(spreading_factor))
    }
}

/// Symbol period in seconds.
pub fn symbol_time_secs(spreading_factor: u8, bandwidth_hz: u32) -> f64 {
    2f64.powi(spreading_factor as i32) / bandwidth_hz as f64
}

/// Time on air of a LoRa frame with explicit header and CRC.
///
/// Low data rate optimisation is switched on for SF11 and SF12.
pub fn time_on_air(params: &RadioParams, payload_len: usize, config: &LoraPhyConfig) -> SimTime {
    let sf = params.spreading_factor as f64;
    let cr = params.coding_rate as f64;
    let t_sym = symbol_time_secs(params.spreading_factor, params.bandwidth_hz);
    let de = if params.spreading_factor >= 11 { 1.0 } else { 0.0 };

    let pl = payload_len as f64;
    let payload_symbols = 8.0 + (((8.0 * pl - 4.0 * sf + 28.0 + 16.0) / (4.0 * (sf - 2.0 * de))).ceil()).max(0.0) * (cr + 4.0);

    let total_symbols = config.preamble_symbols as f64 + 4.25 + payload_symbols;
    SimTime::from_secs(total_symbols * t_sym)
}

/// Nominal bit rate in bit/s.
pub fn bit_rate(spreading_factor: u8, bandwidth_hz: u32, coding_rate: u8) -> f64 {
    spreading_factor as f64 * bandwidth_hz as f64 * 4.0
        / (2f64.powi(spreading_factor as i32) * (coding_rate as f64 + 4.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sf: u8) -> RadioParams {
        RadioParams {
            frequency_hz: 868_100_000,
            bandwidth_hz: 125_000,
            spreading_factor: sf,
            coding_rate: 1,
            tx_power_dbm: 14.0,
        }
    }

    #[test]
    fn test_time_on_air_reference_values() {
        let cfg = LoraPhyConfig::default();
        // Semtech calculator: 20 bytes, BW125, CR4/5, explicit header, CRC on.
        let sf7 = time_on_air(&params(7), 20, &cfg).as_micros();
        assert!((56_000..=57_000).contains(&sf7), "sf7 {}", sf7);
        let sf12 = time_on_air(&params(12), 20, &cfg).as_micros();
        assert!((1_318_000..=1_320_000).contains(&sf12), "sf12 {}", sf12);
    }

    #[test]
    fn test_time_on_air_grows_with_sf_and_payload() {
        let cfg = LoraPhyConfig::default();
        let mut last = SimTime::ZERO;
        for sf in MIN_SF..=MAX_SF {
            let t = time_on_air(&params(sf), 20, &cfg);
            assert!(t > last);
            last = t;
        }
        assert!(time_on_air(&params(9), 50, &cfg) > time_on_air(&params(9), 10, &cfg));
    }

    #[test]
    fn test_snr_threshold_rejects_bad_sf() {
        let cfg = LoraPhyConfig::default();
        assert_eq!(cfg.snr_threshold(12).unwrap(), -20.0);
        assert_eq!(cfg.snr_threshold(6), Err(ConfigError::InvalidSpreadingFactor(6)));
        assert!(validate_sf(13).is_err());
    }

    #[test]
    fn test_bit_rate_sf7() {
        assert!((bit_rate(7, 125_000, 1) - 5468.75).abs() < 1e-6);
    }
}
