//! # lorasim-mac
//!
//! LoRaWAN MAC and network logic for the simulator.
//!
//! This crate provides:
//! - End devices with class A/B/C receive behaviour ([`Device`])
//! - Gateways with per-channel capture decisions ([`Gateway`])
//! - The network server: deduplication, security, ADR, downlinks ([`NetworkServer`])
//! - Join server ([`join::JoinServer`])
//! - Duty-cycle and energy accounting ([`duty_cycle`], [`energy`])

pub mod adr;
pub mod device;
pub mod downlink;
pub mod duty_cycle;
pub mod energy;
pub mod gateway;
pub mod join;
pub mod server;

use lorasim_common::SimTime;
use lorawan_packet::Region;
use serde::{Deserialize, Serialize};

pub use device::{Device, DeviceConfig, DeviceState};
pub use duty_cycle::{DutyCycleConfig, DutyCycleError, DutyCycleLedger};
pub use energy::{EnergyLedger, EnergyProfile, RadioState};
pub use gateway::{Gateway, GatewayConfig};
pub use server::{NetworkServer, ServerConfig};

// ============================================================================
// Shared MAC Parameters
// ============================================================================

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// Channel plan shared by devices, gateways and the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPlan {
    pub region: Region,
    pub uplink_channels: Vec<u32>,
    pub bandwidth_hz: u32,
    /// Coding rate 1..=4 (4/5..4/8).
    pub coding_rate: u8,
    pub rx2_frequency_hz: u32,
    pub rx2_spreading_factor: u8,
}

impl ChannelPlan {
    /// Region defaults.
    pub fn for_region(region: Region) -> Self {
        ChannelPlan {
            region,
            uplink_channels: region.uplink_channels(),
            bandwidth_hz: 125_000,
            coding_rate: 1,
            rx2_frequency_hz: region.rx2_frequency(),
            rx2_spreading_factor: region.rx2_spreading_factor(),
        }
    }

    /// RX1 downlink frequency for an uplink frequency.
    pub fn rx1_frequency(&self, uplink_hz: u32) -> u32 {
        self.region.rx1_frequency(uplink_hz)
    }

    /// Class B ping slots and beacons use the RX2 channel.
    pub fn ping_slot_frequency(&self) -> u32 {
        self.region.beacon_frequency()
    }
}

impl Default for ChannelPlan {
    fn default() -> Self {
        Self::for_region(Region::Eu868)
    }
}

/// Receive window timing relative to the end of an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxTiming {
    pub rx1_delay: SimTime,
    pub rx2_delay: SimTime,
    /// How long a window stays open waiting for a preamble.
    pub rx_window: SimTime,
}

impl Default for RxTiming {
    fn default() -> Self {
        RxTiming {
            rx1_delay: SimTime::from_millis(10),
            rx2_delay: SimTime::from_millis(1010),
            rx_window: SimTime::from_millis(100),
        }
    }
}

/// Class B beacon and ping-slot timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassBTiming {
    pub beacon_interval: SimTime,
    pub ping_slot_offset: SimTime,
    pub ping_slot_interval: SimTime,
    /// Receiver on-time for one beacon.
    pub beacon_rx: SimTime,
}

impl Default for ClassBTiming {
    fn default() -> Self {
        ClassBTiming {
            beacon_interval: SimTime::from_secs(128.0),
            ping_slot_offset: SimTime::from_secs(2.0),
            ping_slot_interval: SimTime::from_secs(1.0),
            beacon_rx: SimTime::from_millis(160),
        }
    }
}

impl ClassBTiming {
    /// Spacing between ping slots for a periodicity (0..=7).
    pub fn ping_period(&self, periodicity: u8) -> SimTime {
        SimTime::from_micros(self.ping_slot_interval.as_micros() << periodicity.min(7))
    }

    /// Ping slot start times inside the beacon period beginning at `beacon`.
    pub fn ping_slots(&self, beacon: SimTime, periodicity: u8) -> Vec<SimTime> {
        let period = self.ping_period(periodicity);
        let next_beacon = beacon + self.beacon_interval;
        let mut slots = Vec::new();
        let mut t = beacon + self.ping_slot_offset;
        if period == SimTime::ZERO {
            return slots;
        }
        while t < next_beacon {
            slots.push(t);
            t = t + period;
        }
        slots
    }

    /// First ping slot starting at or after `after`.
    pub fn next_ping_slot(&self, after: SimTime, periodicity: u8) -> Option<SimTime> {
        let interval = self.beacon_interval.as_micros();
        if interval == 0 {
            return None;
        }
        let mut beacon = SimTime::from_micros(after.as_micros() / interval * interval);
        // The current period may have no slot left; look one period ahead.
        for _ in 0..2 {
            if let Some(t) = self.ping_slots(beacon, periodicity).into_iter().find(|t| *t >= after) {
                return Some(t);
            }
            beacon = beacon + self.beacon_interval;
        }
        None
    }
}

/// All MAC timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacTiming {
    pub rx: RxTiming,
    pub class_b: ClassBTiming,
}
