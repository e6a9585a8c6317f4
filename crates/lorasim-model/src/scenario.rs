//! YAML scenario schema.
//!
//! Every section is optional and falls back to built-in defaults. Device
//! settings resolve in three layers: built-in defaults, then the scenario's
//! `defaults` block, then the device's own `settings`.
//!
//! ## Example YAML
//!
//! ```yaml
//! simulation:
//!   seed: 7
//!   duration_s: 3600
//! channel:
//!   environment: urban
//!   region: eu868
//! network:
//!   adr: true
//!   net_id: "000013"
//! defaults:
//!   spreading_factor: 12
//!   traffic:
//!     interval_s: 300
//! gateways:
//!   - name: gw-0
//!     position: { x: 0, y: 0 }
//! devices:
//!   - name: sensor
//!     count: 10
//!     activation:
//!       mode: otaa
//!       dev_eui: "0004A30B001C0000"
//!       join_eui: "70B3D57ED0000000"
//!       app_key: "2B7E151628AED2A6ABF7158809CF4F3C"
//! ```

use lorasim_common::mobility::MobilityConfig;
use lorasim_common::Position;
use lorasim_mac::adr::{AdrMethod, ADR_ACK_DELAY, ADR_ACK_LIMIT};
use lorasim_mac::DeviceClass;
use lorasim_phy::{AntennaGains, CollisionConfig, Environment, ErrorModelKind, FadingConfig, LoraPhyConfig};
use lorawan_packet::Region;
use serde::{Deserialize, Serialize};

// ============================================================================
// Root
// ============================================================================

/// A complete simulation scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub collision: CollisionConfig,
    #[serde(default)]
    pub network: NetworkSection,
    /// Settings applied to every device unless the device overrides them.
    #[serde(default)]
    pub defaults: DeviceSettings,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub gateways: Vec<GatewaySpec>,
}

/// Run-wide parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSection {
    #[serde(default)]
    pub seed: u64,
    /// Simulated duration in seconds.
    #[serde(default)]
    pub duration_s: Option<f64>,
    /// Stop after this many uplink frames have been sent.
    #[serde(default)]
    pub packet_limit: Option<u64>,
    /// Side of the square in which unplaced radios are deployed.
    #[serde(default = "default_area_m")]
    pub area_m: f64,
}

fn default_area_m() -> f64 {
    1000.0
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            seed: 0,
            duration_s: None,
            packet_limit: None,
            area_m: default_area_m(),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A named propagation preset or explicit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    Named(String),
    Custom(Environment),
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        EnvironmentSpec::Named("urban".to_string())
    }
}

/// Radio channel and PHY parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub region: Region,
    /// Uplink channel list; region channels when absent.
    #[serde(default)]
    pub channels: Option<Vec<u32>>,
    #[serde(default)]
    pub bandwidth_hz: Option<u32>,
    /// Coding rate 1..=4 (4/5..4/8).
    #[serde(default)]
    pub coding_rate: Option<u8>,
    #[serde(default)]
    pub rx2_frequency_hz: Option<u32>,
    #[serde(default)]
    pub rx2_spreading_factor: Option<u8>,
    #[serde(default = "default_preamble_symbols")]
    pub preamble_symbols: u32,
    #[serde(default)]
    pub snr_thresholds: Option<[f64; 6]>,
    #[serde(default = "default_noise_figure_db")]
    pub noise_figure_db: f64,
    #[serde(default = "default_temperature_k")]
    pub temperature_k: f64,
    #[serde(default)]
    pub gains: AntennaGains,
    /// Rayleigh multipath taps; 0 or 1 disables multipath.
    #[serde(default = "default_multipath_taps")]
    pub multipath_taps: u32,
    #[serde(default)]
    pub fading: Option<FadingConfig>,
    #[serde(default)]
    pub error_model: ErrorModelKind,
}

fn default_preamble_symbols() -> u32 {
    LoraPhyConfig::DEFAULT_PREAMBLE_SYMBOLS
}

fn default_noise_figure_db() -> f64 {
    6.0
}

fn default_temperature_k() -> f64 {
    290.0
}

fn default_multipath_taps() -> u32 {
    1
}

impl Default for ChannelSection {
    fn default() -> Self {
        ChannelSection {
            environment: EnvironmentSpec::default(),
            region: Region::default(),
            channels: None,
            bandwidth_hz: None,
            coding_rate: None,
            rx2_frequency_hz: None,
            rx2_spreading_factor: None,
            preamble_symbols: default_preamble_symbols(),
            snr_thresholds: None,
            noise_figure_db: default_noise_figure_db(),
            temperature_k: default_temperature_k(),
            gains: AntennaGains::default(),
            multipath_taps: default_multipath_taps(),
            fading: None,
            error_model: ErrorModelKind::default(),
        }
    }
}

impl ChannelSection {
    /// PHY constants for this channel.
    pub fn phy(&self) -> LoraPhyConfig {
        LoraPhyConfig {
            preamble_symbols: self.preamble_symbols,
            snr_thresholds: self.snr_thresholds.unwrap_or(LoraPhyConfig::DEFAULT_SNR_THRESHOLDS),
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// Network server and MAC timing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    #[serde(default = "default_server_name")]
    pub name: String,
    /// 24-bit NetID, hex.
    #[serde(default = "default_net_id")]
    pub net_id: String,
    #[serde(default = "default_true")]
    pub adr: bool,
    #[serde(default)]
    pub adr_method: AdrMethod,
    #[serde(default = "default_adr_margin_db")]
    pub adr_margin_db: f64,
    #[serde(default = "default_adr_history")]
    pub adr_history: usize,
    #[serde(default = "default_aggregation_window_s")]
    pub aggregation_window_s: f64,
    #[serde(default = "default_rx1_delay_s")]
    pub rx1_delay_s: f64,
    /// RX1 delay plus one second when absent.
    #[serde(default)]
    pub rx2_delay_s: Option<f64>,
    #[serde(default = "default_rx_window_s")]
    pub rx_window_s: f64,
    #[serde(default)]
    pub backhaul_delay_s: f64,
    #[serde(default)]
    pub class_b: ClassBSection,
}

fn default_server_name() -> String {
    "network-server".to_string()
}

fn default_net_id() -> String {
    "000013".to_string()
}

fn default_true() -> bool {
    true
}

fn default_adr_margin_db() -> f64 {
    10.0
}

fn default_adr_history() -> usize {
    20
}

fn default_aggregation_window_s() -> f64 {
    1.2
}

fn default_rx1_delay_s() -> f64 {
    0.01
}

fn default_rx_window_s() -> f64 {
    0.1
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            name: default_server_name(),
            net_id: default_net_id(),
            adr: true,
            adr_method: AdrMethod::default(),
            adr_margin_db: default_adr_margin_db(),
            adr_history: default_adr_history(),
            aggregation_window_s: default_aggregation_window_s(),
            rx1_delay_s: default_rx1_delay_s(),
            rx2_delay_s: None,
            rx_window_s: default_rx_window_s(),
            backhaul_delay_s: 0.0,
            class_b: ClassBSection::default(),
        }
    }
}

/// Class B beacon timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassBSection {
    #[serde(default = "default_beacon_interval_s")]
    pub beacon_interval_s: f64,
    #[serde(default = "default_ping_slot_offset_s")]
    pub ping_slot_offset_s: f64,
    #[serde(default = "default_ping_slot_interval_s")]
    pub ping_slot_interval_s: f64,
    #[serde(default = "default_beacon_rx_s")]
    pub beacon_rx_s: f64,
}

fn default_beacon_interval_s() -> f64 {
    128.0
}

fn default_ping_slot_offset_s() -> f64 {
    2.0
}

fn default_ping_slot_interval_s() -> f64 {
    1.0
}

fn default_beacon_rx_s() -> f64 {
    0.16
}

impl Default for ClassBSection {
    fn default() -> Self {
        ClassBSection {
            beacon_interval_s: default_beacon_interval_s(),
            ping_slot_offset_s: default_ping_slot_offset_s(),
            ping_slot_interval_s: default_ping_slot_interval_s(),
            beacon_rx_s: default_beacon_rx_s(),
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Traffic block. Replaces the inherited block as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficSpec {
    #[serde(default)]
    pub model: TrafficModelSpec,
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    #[serde(default = "default_fport")]
    pub fport: u8,
    #[serde(default)]
    pub confirmed: bool,
    /// First intent; random within the first interval when absent.
    #[serde(default)]
    pub first_at_s: Option<f64>,
}

fn default_interval_s() -> f64 {
    600.0
}

fn default_payload_bytes() -> usize {
    20
}

fn default_fport() -> u8 {
    1
}

impl Default for TrafficSpec {
    fn default() -> Self {
        TrafficSpec {
            model: TrafficModelSpec::default(),
            interval_s: default_interval_s(),
            payload_bytes: default_payload_bytes(),
            fport: default_fport(),
            confirmed: false,
            first_at_s: None,
        }
    }
}

/// Inter-arrival law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficModelSpec {
    #[default]
    Periodic,
    Poisson,
}

/// Duty-cycle limit of a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DutyCycleSpec {
    /// Fraction of time on air, e.g. 0.01.
    pub quota: f64,
    #[serde(default = "default_duty_window_s")]
    pub window_s: f64,
}

fn default_duty_window_s() -> f64 {
    3600.0
}

/// Overridable device settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    #[serde(default)]
    pub class: Option<DeviceClass>,
    #[serde(default)]
    pub spreading_factor: Option<u8>,
    /// Mapped to the closest regional power step.
    #[serde(default)]
    pub tx_power_dbm: Option<f64>,
    #[serde(default)]
    pub adr: Option<bool>,
    /// Uplinks without downlink before ADRACKReq is set.
    #[serde(default)]
    pub adr_ack_limit: Option<u32>,
    /// Further uplinks before reverting to the configured SF and power.
    #[serde(default)]
    pub adr_ack_delay: Option<u32>,
    #[serde(default)]
    pub nb_trans: Option<u8>,
    #[serde(default)]
    pub duty_cycle: Option<DutyCycleSpec>,
    #[serde(default)]
    pub energy_profile: Option<String>,
    #[serde(default)]
    pub battery_j: Option<f64>,
    /// Stop generating after this many frames.
    #[serde(default)]
    pub packet_limit: Option<u64>,
    #[serde(default)]
    pub ping_periodicity: Option<u8>,
    #[serde(default)]
    pub link_check_interval: Option<u32>,
    #[serde(default)]
    pub traffic: Option<TrafficSpec>,
    /// Server-originated application downlinks.
    #[serde(default)]
    pub downlink_interval_s: Option<f64>,
    #[serde(default)]
    pub downlink_payload_bytes: Option<usize>,
}

impl DeviceSettings {
    /// Layer `over` on top of `self`: fields set in `over` win.
    pub fn merged(&self, over: &DeviceSettings) -> DeviceSettings {
        DeviceSettings {
            class: over.class.or(self.class),
            spreading_factor: over.spreading_factor.or(self.spreading_factor),
            tx_power_dbm: over.tx_power_dbm.or(self.tx_power_dbm),
            adr: over.adr.or(self.adr),
            adr_ack_limit: over.adr_ack_limit.or(self.adr_ack_limit),
            adr_ack_delay: over.adr_ack_delay.or(self.adr_ack_delay),
            nb_trans: over.nb_trans.or(self.nb_trans),
            duty_cycle: over.duty_cycle.or(self.duty_cycle),
            energy_profile: over.energy_profile.clone().or_else(|| self.energy_profile.clone()),
            battery_j: over.battery_j.or(self.battery_j),
            packet_limit: over.packet_limit.or(self.packet_limit),
            ping_periodicity: over.ping_periodicity.or(self.ping_periodicity),
            link_check_interval: over.link_check_interval.or(self.link_check_interval),
            traffic: over.traffic.clone().or_else(|| self.traffic.clone()),
            downlink_interval_s: over.downlink_interval_s.or(self.downlink_interval_s),
            downlink_payload_bytes: over.downlink_payload_bytes.or(self.downlink_payload_bytes),
        }
    }
}

/// Device settings with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub class: DeviceClass,
    pub spreading_factor: u8,
    pub tx_power_dbm: f64,
    pub adr: bool,
    pub adr_ack_limit: u32,
    pub adr_ack_delay: u32,
    pub nb_trans: u8,
    pub duty_cycle: Option<DutyCycleSpec>,
    pub energy_profile: String,
    pub battery_j: Option<f64>,
    pub packet_limit: Option<u64>,
    pub ping_periodicity: u8,
    pub link_check_interval: Option<u32>,
    pub traffic: TrafficSpec,
    pub downlink_interval_s: Option<f64>,
    pub downlink_payload_bytes: usize,
}

impl From<&DeviceSettings> for ResolvedSettings {
    fn from(s: &DeviceSettings) -> Self {
        ResolvedSettings {
            class: s.class.unwrap_or_default(),
            spreading_factor: s.spreading_factor.unwrap_or(12),
            tx_power_dbm: s.tx_power_dbm.unwrap_or(14.0),
            adr: s.adr.unwrap_or(true),
            adr_ack_limit: s.adr_ack_limit.unwrap_or(ADR_ACK_LIMIT),
            adr_ack_delay: s.adr_ack_delay.unwrap_or(ADR_ACK_DELAY),
            nb_trans: s.nb_trans.unwrap_or(1),
            duty_cycle: s.duty_cycle,
            energy_profile: s.energy_profile.clone().unwrap_or_else(|| "flora".to_string()),
            battery_j: s.battery_j,
            packet_limit: s.packet_limit,
            ping_periodicity: s.ping_periodicity.unwrap_or(0),
            link_check_interval: s.link_check_interval,
            traffic: s.traffic.clone().unwrap_or_default(),
            downlink_interval_s: s.downlink_interval_s,
            downlink_payload_bytes: s.downlink_payload_bytes.unwrap_or(8),
        }
    }
}

/// How a device (or each member of a group) is activated. Keys are hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActivationSpec {
    /// Group members get consecutive DevEUIs starting at `dev_eui`.
    Otaa {
        dev_eui: String,
        join_eui: String,
        app_key: String,
    },
    /// Group members get consecutive DevAddrs starting at `dev_addr`.
    Abp {
        dev_addr: String,
        nwk_skey: String,
        app_skey: String,
    },
}

/// One device, or a group of identical devices when `count` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub name: String,
    /// Expand into `count` devices named `<name>-<i>`.
    #[serde(default)]
    pub count: Option<u32>,
    /// Fixed position; random inside the deployment area when absent.
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub mobility: Option<MobilityConfig>,
    pub activation: ActivationSpec,
    #[serde(default)]
    pub settings: DeviceSettings,
}

/// A gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySpec {
    pub name: String,
    /// Fixed position; centre of the deployment area when absent.
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub mobility: Option<MobilityConfig>,
    #[serde(default = "default_gateway_tx_power_dbm")]
    pub tx_power_dbm: f64,
}

fn default_gateway_tx_power_dbm() -> f64 {
    14.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_layering() {
        let defaults = DeviceSettings {
            spreading_factor: Some(9),
            adr: Some(false),
            ..DeviceSettings::default()
        };
        let own = DeviceSettings {
            spreading_factor: Some(7),
            nb_trans: Some(3),
            ..DeviceSettings::default()
        };
        let resolved = ResolvedSettings::from(&defaults.merged(&own));
        assert_eq!(resolved.spreading_factor, 7);
        assert!(!resolved.adr);
        assert_eq!(resolved.nb_trans, 3);
        assert_eq!((resolved.adr_ack_limit, resolved.adr_ack_delay), (64, 32));
        // built-in defaults fill the rest
        assert_eq!(resolved.class, DeviceClass::A);
        assert_eq!(resolved.energy_profile, "flora");
        assert_eq!(resolved.traffic, TrafficSpec::default());
    }

    #[test]
    fn test_adr_ack_keys_layer() {
        let defaults: DeviceSettings = serde_yaml::from_str("{ adr_ack_limit: 8, adr_ack_delay: 4 }").unwrap();
        let own: DeviceSettings = serde_yaml::from_str("{ adr_ack_delay: 12 }").unwrap();
        let resolved = ResolvedSettings::from(&defaults.merged(&own));
        assert_eq!(resolved.adr_ack_limit, 8);
        assert_eq!(resolved.adr_ack_delay, 12);
        assert!(serde_yaml::from_str::<DeviceSettings>("{ adr_ack_limt: 8 }").is_err());
    }

    #[test]
    fn test_environment_spec_forms() {
        let named: EnvironmentSpec = serde_yaml::from_str("rural").unwrap();
        assert_eq!(named, EnvironmentSpec::Named("rural".into()));
        let custom: EnvironmentSpec = serde_yaml::from_str(
            "{ path_loss_exponent: 2.7, shadowing_std_db: 0.0, reference_loss_db: 127.41, reference_distance_m: 40.0 }",
        )
        .unwrap();
        assert!(matches!(custom, EnvironmentSpec::Custom(e) if e.shadowing_std_db == 0.0));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(serde_yaml::from_str::<Scenario>("simulation: { seed: 1, sead: 2 }").is_err());
        assert!(serde_yaml::from_str::<Scenario>("bogus: 1").is_err());
        assert!(serde_yaml::from_str::<Scenario>(
            "devices:\n  - name: d\n    activation: { mode: abp, dev_addr: \"01\", nwk_skey: \"\", app_skey: \"\", extra: 1 }"
        )
        .is_err());
    }
}
