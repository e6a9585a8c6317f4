//! Regional parameters: channel plans, data rates and TX power steps.

use serde::{Deserialize, Serialize};

/// Supported regional plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Europe 863-870 MHz.
    #[default]
    Eu868,
    /// United States 902-928 MHz (first sub-band).
    Us915,
}

/// Data rate index to spreading factor (125 kHz rates only).
pub const DR_TO_SF: [u8; 6] = [12, 11, 10, 9, 8, 7];

/// TX power index to dBm offset from max EIRP, EU868 style.
pub const TX_POWER_INDEX_TO_DBM: [f64; 7] = [14.0, 12.0, 10.0, 8.0, 6.0, 4.0, 2.0];

/// Highest valid TX power index.
pub const MAX_TX_POWER_INDEX: u8 = (TX_POWER_INDEX_TO_DBM.len() - 1) as u8;

impl Region {
    /// Uplink channel centre frequencies in Hz.
    pub fn uplink_channels(self) -> Vec<u32> {
        match self {
            Region::Eu868 => vec![868_100_000, 868_300_000, 868_500_000],
            Region::Us915 => (0..8).map(|i| 902_300_000 + 200_000 * i).collect(),
        }
    }

    /// RX2 frequency in Hz.
    pub fn rx2_frequency(self) -> u32 {
        match self {
            Region::Eu868 => 869_525_000,
            Region::Us915 => 923_300_000,
        }
    }

    /// RX2 spreading factor.
    pub fn rx2_spreading_factor(self) -> u8 {
        12
    }

    /// Downlink frequency used in RX1 for an uplink on `uplink_hz`.
    pub fn rx1_frequency(self, uplink_hz: u32) -> u32 {
        match self {
            Region::Eu868 => uplink_hz,
            Region::Us915 => {
                let index = uplink_hz.saturating_sub(902_300_000) / 200_000;
                923_300_000 + 600_000 * (index % 8)
            }
        }
    }

    /// Beacon frequency in Hz.
    pub fn beacon_frequency(self) -> u32 {
        match self {
            Region::Eu868 => 869_525_000,
            Region::Us915 => 923_300_000,
        }
    }
}

/// Spreading factor for a data rate index.
pub fn dr_to_sf(data_rate: u8) -> Option<u8> {
    DR_TO_SF.get(data_rate as usize).copied()
}

/// Data rate index for a spreading factor.
pub fn sf_to_dr(sf: u8) -> Option<u8> {
    DR_TO_SF.iter().position(|&s| s == sf).map(|i| i as u8)
}

/// TX power in dBm for a power index.
pub fn tx_power_dbm(index: u8) -> Option<f64> {
    TX_POWER_INDEX_TO_DBM.get(index as usize).copied()
}

/// Power index whose dBm value is closest to `dbm`.
pub fn tx_power_index(dbm: f64) -> u8 {
    TX_POWER_INDEX_TO_DBM
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - dbm)
                .abs()
                .partial_cmp(&(*b - dbm).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i as u8)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dr_sf_mapping() {
        assert_eq!(dr_to_sf(0), Some(12));
        assert_eq!(dr_to_sf(5), Some(7));
        assert_eq!(dr_to_sf(6), None);
        for sf in 7..=12 {
            assert_eq!(dr_to_sf(sf_to_dr(sf).unwrap()), Some(sf));
        }
    }

    #[test]
    fn test_tx_power_index_nearest() {
        assert_eq!(tx_power_index(14.0), 0);
        assert_eq!(tx_power_index(11.0), 1);
        assert_eq!(tx_power_index(2.0), MAX_TX_POWER_INDEX);
        assert_eq!(tx_power_index(20.0), 0);
    }

    #[test]
    fn test_channel_plans() {
        assert_eq!(Region::Eu868.uplink_channels().len(), 3);
        let us = Region::Us915.uplink_channels();
        assert_eq!(us.len(), 8);
        assert_eq!(us[7], 903_700_000);
        assert_eq!(Region::Us915.rx1_frequency(902_500_000), 923_900_000);
    }
}
