//! # lorasim-model
//!
//! Scenario loading and simulation building for the LoRaWAN simulator.
//!
//! This crate provides:
//! - The YAML scenario schema ([`Scenario`])
//! - Loading and validation ([`load_scenario`], [`validate_scenario`])
//! - Building the entity graph and its seed events ([`SimulationBuilder`])
//!
//! Entity IDs are allocated as: medium, network server, gateways in file
//! order, then devices in file order (groups expanded in place).

pub mod scenario;

use lorasim_common::mobility::position_source;
use lorasim_common::{
    ConfigError, Entity, EntityId, EntityRegistry, Event, EventId, EventPayload, Position, RadioParams, SimTime,
};
use lorasim_mac::adr::AdrConfig;
use lorasim_mac::device::{Activation, TrafficConfig, TrafficModel};
use lorasim_mac::server::DeviceRegistration;
use lorasim_mac::{
    ChannelPlan, ClassBTiming, Device, DeviceConfig, DutyCycleConfig, EnergyProfile, Gateway, GatewayConfig,
    MacTiming, NetworkServer, RxTiming, ServerConfig,
};
use lorasim_phy::propagation::noise_floor;
use lorasim_phy::{
    select_error_model, time_on_air, validate_sf, CorrelatedFading, Environment, ErrorModel, LinkEvaluator,
    LoraPhyConfig, Medium, RadioSite, SiteRole,
};
use lorawan_packet::region::tx_power_index;
use lorawan_packet::{AesKey, DevAddr, Eui64, SessionKeys, MAX_FOPTS, MAX_PHY_PAYLOAD};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use scenario::{
    ActivationSpec, ChannelSection, DeviceSettings, DeviceSpec, EnvironmentSpec, GatewaySpec, NetworkSection,
    ResolvedSettings, Scenario, SimulationSection, TrafficModelSpec, TrafficSpec,
};

/// Entity ID of the radio medium.
pub const MEDIUM_ID: EntityId = EntityId(0);
/// Entity ID of the network server.
pub const SERVER_ID: EntityId = EntityId(1);

/// MHDR, FHDR without FOpts, FPort and MIC.
const DATA_FRAME_OVERHEAD: usize = 13;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while loading or building a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Parameter rejected by a component.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two radios share a name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// Invalid key, EUI or address.
    #[error("Invalid key: {0}")]
    InvalidKeySpec(String),
}

// ============================================================================
// Loading
// ============================================================================

/// Load and validate a scenario file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ModelError> {
    let text = std::fs::read_to_string(path)?;
    load_scenario_from_str(&text)
}

/// Parse and validate a scenario from a YAML string.
pub fn load_scenario_from_str(yaml: &str) -> Result<Scenario, ModelError> {
    let scenario: Scenario = serde_yaml::from_str(yaml)?;
    validate_scenario(&scenario)?;
    Ok(scenario)
}

// ============================================================================
// Resolution
// ============================================================================

/// One concrete device after group expansion and settings layering.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub name: String,
    pub settings: ResolvedSettings,
    pub activation: Activation,
    /// Index of the originating entry in `Scenario::devices`.
    pub spec_index: usize,
}

fn key_error(field: &str, err: impl std::fmt::Display) -> ModelError {
    ModelError::InvalidKeySpec(format!("{}: {}", field, err))
}

/// Parse a fixed-width big-endian hex value.
fn parse_hex_u32(field: &str, value: &str, width: usize) -> Result<u32, ModelError> {
    let raw = hex::decode(value.trim()).map_err(|e| key_error(field, e))?;
    if raw.len() != width {
        return Err(key_error(field, format!("expected {} bytes, got {}", width, raw.len())));
    }
    Ok(raw.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn parse_key(field: &str, value: &str) -> Result<AesKey, ModelError> {
    AesKey::from_hex(value.trim()).map_err(|e| key_error(field, e))
}

fn activation_for(spec: &DeviceSpec, member: u32) -> Result<Activation, ModelError> {
    let offset = u64::from(member);
    match &spec.activation {
        ActivationSpec::Otaa {
            dev_eui,
            join_eui,
            app_key,
        } => {
            let base = Eui64::from_hex(dev_eui.trim()).map_err(|e| key_error(&format!("{}.dev_eui", spec.name), e))?;
            Ok(Activation::Otaa {
                dev_eui: Eui64(base.0.wrapping_add(offset)),
                join_eui: Eui64::from_hex(join_eui.trim())
                    .map_err(|e| key_error(&format!("{}.join_eui", spec.name), e))?,
                app_key: parse_key(&format!("{}.app_key", spec.name), app_key)?,
            })
        }
        ActivationSpec::Abp {
            dev_addr,
            nwk_skey,
            app_skey,
        } => {
            let base = parse_hex_u32(&format!("{}.dev_addr", spec.name), dev_addr, 4)?;
            Ok(Activation::Abp {
                dev_addr: DevAddr(base.wrapping_add(member)),
                keys: SessionKeys {
                    nwk_skey: parse_key(&format!("{}.nwk_skey", spec.name), nwk_skey)?,
                    app_skey: parse_key(&format!("{}.app_skey", spec.name), app_skey)?,
                },
            })
        }
    }
}

/// Expand groups and resolve every device's settings.
pub fn resolve_devices(scenario: &Scenario) -> Result<Vec<ResolvedDevice>, ModelError> {
    let mut devices = Vec::new();
    for (spec_index, spec) in scenario.devices.iter().enumerate() {
        let settings = ResolvedSettings::from(&scenario.defaults.merged(&spec.settings));
        match spec.count {
            None => devices.push(ResolvedDevice {
                name: spec.name.clone(),
                settings,
                activation: activation_for(spec, 0)?,
                spec_index,
            }),
            Some(0) => {
                return Err(ModelError::InvalidConfig(format!("device group '{}' has count 0", spec.name)));
            }
            Some(count) => {
                for member in 0..count {
                    devices.push(ResolvedDevice {
                        name: format!("{}-{}", spec.name, member),
                        settings: settings.clone(),
                        activation: activation_for(spec, member)?,
                        spec_index,
                    });
                }
            }
        }
    }
    Ok(devices)
}

fn secs(field: &str, value: f64) -> Result<SimTime, ModelError> {
    SimTime::try_from_secs(value)
        .map_err(|_| ModelError::InvalidConfig(format!("{} must be a non-negative number of seconds, got {}", field, value)))
}

fn positive_secs(field: &str, value: f64) -> Result<SimTime, ModelError> {
    let t = secs(field, value)?;
    if t == SimTime::ZERO {
        return Err(ModelError::InvalidConfig(format!("{} must be positive", field)));
    }
    Ok(t)
}

/// Channel plan with the scenario's overrides applied.
pub fn channel_plan(channel: &ChannelSection) -> ChannelPlan {
    let mut plan = ChannelPlan::for_region(channel.region);
    if let Some(channels) = &channel.channels {
        plan.uplink_channels = channels.clone();
    }
    if let Some(bw) = channel.bandwidth_hz {
        plan.bandwidth_hz = bw;
    }
    if let Some(cr) = channel.coding_rate {
        plan.coding_rate = cr;
    }
    if let Some(f) = channel.rx2_frequency_hz {
        plan.rx2_frequency_hz = f;
    }
    if let Some(sf) = channel.rx2_spreading_factor {
        plan.rx2_spreading_factor = sf;
    }
    plan
}

/// MAC timing from the network section.
pub fn mac_timing(network: &NetworkSection) -> Result<MacTiming, ModelError> {
    let rx1_delay = secs("network.rx1_delay_s", network.rx1_delay_s)?;
    let rx2_delay = match network.rx2_delay_s {
        Some(s) => secs("network.rx2_delay_s", s)?,
        None => rx1_delay + SimTime::from_secs(1.0),
    };
    if rx2_delay <= rx1_delay {
        return Err(ModelError::InvalidConfig("network.rx2_delay_s must exceed rx1_delay_s".into()));
    }
    let class_b = &network.class_b;
    Ok(MacTiming {
        rx: RxTiming {
            rx1_delay,
            rx2_delay,
            rx_window: positive_secs("network.rx_window_s", network.rx_window_s)?,
        },
        class_b: ClassBTiming {
            beacon_interval: positive_secs("network.class_b.beacon_interval_s", class_b.beacon_interval_s)?,
            ping_slot_offset: secs("network.class_b.ping_slot_offset_s", class_b.ping_slot_offset_s)?,
            ping_slot_interval: positive_secs("network.class_b.ping_slot_interval_s", class_b.ping_slot_interval_s)?,
            beacon_rx: positive_secs("network.class_b.beacon_rx_s", class_b.beacon_rx_s)?,
        },
    })
}

fn environment(channel: &ChannelSection) -> Result<Environment, ModelError> {
    let env = match &channel.environment {
        EnvironmentSpec::Named(name) => Environment::from_name(name)?,
        EnvironmentSpec::Custom(env) => *env,
    };
    env.validate()?;
    Ok(env)
}

// ============================================================================
// Validation
// ============================================================================

fn validate_device(device: &ResolvedDevice, plan: &ChannelPlan, phy: &LoraPhyConfig) -> Result<(), ModelError> {
    let s = &device.settings;
    validate_sf(s.spreading_factor)?;
    EnergyProfile::from_name(&s.energy_profile)?;
    if s.nb_trans == 0 || s.nb_trans > 15 {
        return Err(ConfigError::invalid(format!("{}.nb_trans", device.name), "must be in 1..=15").into());
    }
    if s.ping_periodicity > 7 {
        return Err(ConfigError::invalid(format!("{}.ping_periodicity", device.name), "must be in 0..=7").into());
    }
    if let Some(battery) = s.battery_j {
        if !(battery > 0.0) {
            return Err(ConfigError::invalid(format!("{}.battery_j", device.name), "must be positive").into());
        }
    }
    positive_secs(&format!("{}.traffic.interval_s", device.name), s.traffic.interval_s)?;
    if let Some(first) = s.traffic.first_at_s {
        secs(&format!("{}.traffic.first_at_s", device.name), first)?;
    }
    if let Some(interval) = s.downlink_interval_s {
        positive_secs(&format!("{}.downlink_interval_s", device.name), interval)?;
    }

    let max_frame = DATA_FRAME_OVERHEAD + MAX_FOPTS + s.traffic.payload_bytes;
    if max_frame > MAX_PHY_PAYLOAD {
        return Err(ConfigError::invalid(
            format!("{}.traffic.payload_bytes", device.name),
            format!("frame of up to {} bytes exceeds {}", max_frame, MAX_PHY_PAYLOAD),
        )
        .into());
    }

    if let Some(dc) = s.duty_cycle {
        let config = DutyCycleConfig::new(dc.quota, positive_secs(&format!("{}.duty_cycle.window_s", device.name), dc.window_s)?)?;
        // ADR_ACK back-off can always push a device to SF12
        let worst = RadioParams {
            frequency_hz: plan.uplink_channels.first().copied().unwrap_or_default(),
            bandwidth_hz: plan.bandwidth_hz,
            spreading_factor: 12,
            coding_rate: plan.coding_rate,
            tx_power_dbm: s.tx_power_dbm,
        };
        let airtime = time_on_air(&worst, max_frame, phy);
        if airtime > config.budget() {
            return Err(ConfigError::invalid(
                format!("{}.duty_cycle", device.name),
                format!(
                    "a {:.3} s frame never fits a {:.3} s budget",
                    airtime.as_secs_f64(),
                    config.budget().as_secs_f64()
                ),
            )
            .into());
        }
    }
    Ok(())
}

/// Check a scenario for problems that would make building fail.
pub fn validate_scenario(scenario: &Scenario) -> Result<(), ModelError> {
    let sim = &scenario.simulation;
    if let Some(d) = sim.duration_s {
        positive_secs("simulation.duration_s", d)?;
    }
    if sim.packet_limit == Some(0) {
        return Err(ModelError::InvalidConfig("simulation.packet_limit must be positive".into()));
    }
    if !(sim.area_m > 0.0) || !sim.area_m.is_finite() {
        return Err(ModelError::InvalidConfig("simulation.area_m must be positive".into()));
    }

    environment(&scenario.channel)?;
    let plan = channel_plan(&scenario.channel);
    if plan.uplink_channels.is_empty() {
        return Err(ConfigError::invalid("channel.channels", "no uplink channel").into());
    }
    validate_sf(plan.rx2_spreading_factor)?;
    if !(1..=4).contains(&plan.coding_rate) {
        return Err(ConfigError::invalid("channel.coding_rate", "must be in 1..=4").into());
    }
    if let Some(f) = &scenario.channel.fading {
        CorrelatedFading::new(f.correlation, f.mean_db, f.std_db)?;
    }
    let phy = scenario.channel.phy();

    let network = &scenario.network;
    parse_hex_u32("network.net_id", &network.net_id, 3)?;
    mac_timing(network)?;
    secs("network.aggregation_window_s", network.aggregation_window_s)?;
    secs("network.backhaul_delay_s", network.backhaul_delay_s)?;
    if network.adr_history == 0 {
        return Err(ModelError::InvalidConfig("network.adr_history must be positive".into()));
    }

    if scenario.gateways.is_empty() {
        return Err(ModelError::InvalidConfig("at least one gateway is required".into()));
    }

    let mut names = BTreeSet::new();
    names.insert(network.name.clone());
    for gw in &scenario.gateways {
        if !names.insert(gw.name.clone()) {
            return Err(ModelError::DuplicateNode(gw.name.clone()));
        }
        if let Some(m) = &gw.mobility {
            m.build()?;
        }
    }

    let devices = resolve_devices(scenario)?;
    let mut addrs = BTreeSet::new();
    let mut euis = BTreeSet::new();
    for device in &devices {
        if !names.insert(device.name.clone()) {
            return Err(ModelError::DuplicateNode(device.name.clone()));
        }
        match &device.activation {
            Activation::Abp { dev_addr, .. } => {
                if !addrs.insert(*dev_addr) {
                    return Err(ModelError::InvalidKeySpec(format!("{}: DevAddr {} already in use", device.name, dev_addr)));
                }
            }
            Activation::Otaa { dev_eui, .. } => {
                if !euis.insert(*dev_eui) {
                    return Err(ModelError::InvalidKeySpec(format!("{}: DevEUI {} already in use", device.name, dev_eui)));
                }
            }
        }
        validate_device(device, &plan, &phy)?;
    }
    for spec in &scenario.devices {
        if let Some(m) = &spec.mobility {
            m.build()?;
        }
    }
    Ok(())
}

// ============================================================================
// Building
// ============================================================================

/// What a built entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Medium,
    Server,
    Gateway,
    Device,
}

/// Information about a built entity for display and reporting.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    pub entity_id: EntityId,
    /// Position at simulation start (radios only).
    pub position: Option<Position>,
}

/// Result of building a simulation from a scenario.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each entity.
    pub nodes: Vec<NodeInfo>,
    pub timing: MacTiming,
    pub aggregation_window: SimTime,
}

impl BuiltSimulation {
    /// Time after an uplink ends until every consequence of it (dedup,
    /// server reply, both receive windows) has played out.
    pub fn settle_time(&self) -> SimTime {
        self.aggregation_window + self.timing.rx.rx2_delay + self.timing.rx.rx_window
    }

    /// Look up an entity by name.
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Builds a [`BuiltSimulation`] from a validated scenario.
pub struct SimulationBuilder<'a> {
    scenario: &'a Scenario,
    seed: u64,
    accelerated: Option<Arc<dyn ErrorModel>>,
}

impl<'a> SimulationBuilder<'a> {
    /// Builder using the scenario's own seed.
    pub fn new(scenario: &'a Scenario) -> Self {
        SimulationBuilder {
            scenario,
            seed: scenario.simulation.seed,
            accelerated: None,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Register the backend used when the channel selects the
    /// `accelerated` error model.
    pub fn with_accelerated_error_model(mut self, backend: Arc<dyn ErrorModel>) -> Self {
        self.accelerated = Some(backend);
        self
    }

    pub fn build(self) -> Result<BuiltSimulation, ModelError> {
        let scenario = self.scenario;
        validate_scenario(scenario)?;

        // Placement and first-intent draws; the run itself uses the
        // context's stream.
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let area = scenario.simulation.area_m;

        let channel = &scenario.channel;
        let plan = channel_plan(channel);
        let phy = channel.phy();
        let timing = mac_timing(&scenario.network)?;
        let aggregation_window = secs("network.aggregation_window_s", scenario.network.aggregation_window_s)?;
        let backhaul_delay = secs("network.backhaul_delay_s", scenario.network.backhaul_delay_s)?;
        let net_id = parse_hex_u32("network.net_id", &scenario.network.net_id, 3)?;

        let error_model = select_error_model(
            channel.error_model,
            self.accelerated.clone(),
            &phy,
            plan.bandwidth_hz,
            plan.coding_rate,
        );
        let noise = noise_floor(plan.bandwidth_hz, channel.temperature_k, channel.noise_figure_db);
        let evaluator = LinkEvaluator::new(environment(channel)?, channel.gains, noise, channel.multipath_taps, error_model)?;
        let mut medium = Medium::new(MEDIUM_ID, evaluator, channel.fading);

        let mut nodes = vec![
            NodeInfo {
                name: "medium".to_string(),
                kind: NodeKind::Medium,
                entity_id: MEDIUM_ID,
                position: None,
            },
            NodeInfo {
                name: scenario.network.name.clone(),
                kind: NodeKind::Server,
                entity_id: SERVER_ID,
                position: None,
            },
        ];
        let mut next_entity_id: u64 = SERVER_ID.0 + 1;

        // Gateways
        let mut gateway_ids = Vec::with_capacity(scenario.gateways.len());
        let mut gateway_names = BTreeMap::new();
        for gw in &scenario.gateways {
            let id = EntityId::new(next_entity_id);
            next_entity_id += 1;
            let fixed = gw.position.unwrap_or_else(|| Position::new(area / 2.0, area / 2.0));
            let source = position_source(fixed, gw.mobility.as_ref())?;
            let start = source.position_at(SimTime::ZERO);
            medium.add_site(
                id,
                RadioSite {
                    name: gw.name.clone(),
                    role: SiteRole::Gateway,
                    position: source,
                },
            );
            gateway_ids.push(id);
            gateway_names.insert(id, gw.name.clone());
            nodes.push(NodeInfo {
                name: gw.name.clone(),
                kind: NodeKind::Gateway,
                entity_id: id,
                position: Some(start),
            });
        }

        // Devices
        let resolved = resolve_devices(scenario)?;
        let mut device_names = BTreeMap::new();
        let mut devices = Vec::with_capacity(resolved.len());
        let mut registrations = Vec::with_capacity(resolved.len());
        for device in resolved {
            let id = EntityId::new(next_entity_id);
            next_entity_id += 1;
            let spec = &scenario.devices[device.spec_index];
            let fixed = match spec.position {
                Some(p) => p,
                None => Position::new(rng.gen::<f64>() * area, rng.gen::<f64>() * area),
            };
            let source = position_source(fixed, spec.mobility.as_ref())?;
            let start = source.position_at(SimTime::ZERO);
            medium.add_site(
                id,
                RadioSite {
                    name: device.name.clone(),
                    role: SiteRole::Device,
                    position: source,
                },
            );
            device_names.insert(id, device.name.clone());

            let s = &device.settings;
            let duty_cycle = match s.duty_cycle {
                Some(dc) => Some(DutyCycleConfig::new(dc.quota, secs("duty_cycle.window_s", dc.window_s)?)?),
                None => None,
            };
            let traffic = TrafficConfig {
                model: match s.traffic.model {
                    TrafficModelSpec::Periodic => TrafficModel::Periodic,
                    TrafficModelSpec::Poisson => TrafficModel::Poisson,
                },
                interval: secs("traffic.interval_s", s.traffic.interval_s)?,
                payload_bytes: s.traffic.payload_bytes,
                fport: s.traffic.fport,
                confirmed: s.traffic.confirmed,
                first_at: s.traffic.first_at_s.map(|t| secs("traffic.first_at_s", t)).transpose()?,
            };
            let downlink_interval = s
                .downlink_interval_s
                .map(|t| secs("downlink_interval_s", t))
                .transpose()?;

            registrations.push(DeviceRegistration {
                name: device.name.clone(),
                entity: id,
                class: s.class,
                ping_periodicity: s.ping_periodicity,
                activation: device.activation.clone(),
                downlink_interval,
                downlink_payload_bytes: s.downlink_payload_bytes,
            });
            let config = DeviceConfig {
                name: device.name.clone(),
                class: s.class,
                activation: device.activation,
                traffic,
                spreading_factor: s.spreading_factor,
                tx_power_index: tx_power_index(s.tx_power_dbm),
                adr: s.adr,
                adr_ack_limit: s.adr_ack_limit,
                adr_ack_delay: s.adr_ack_delay,
                nb_trans: s.nb_trans,
                duty_cycle,
                energy: EnergyProfile::from_name(&s.energy_profile)?,
                battery_j: s.battery_j,
                packet_limit: s.packet_limit,
                ping_periodicity: s.ping_periodicity,
                link_check_interval: s.link_check_interval,
                medium: MEDIUM_ID,
                plan: plan.clone(),
                timing,
                phy: phy.clone(),
            };
            devices.push(Device::new(id, config)?);
            nodes.push(NodeInfo {
                name: device.name,
                kind: NodeKind::Device,
                entity_id: id,
                position: Some(start),
            });
        }

        let device_names = Arc::new(device_names);
        let mut entities = EntityRegistry::new();
        let mut initial_events = Vec::new();
        let mut push_event = |entity: EntityId, time: SimTime, payload: EventPayload| {
            initial_events.push(Event {
                id: EventId(initial_events.len() as u64),
                time,
                source: entity,
                targets: vec![entity],
                payload,
            });
        };

        let server = NetworkServer::new(
            SERVER_ID,
            ServerConfig {
                name: scenario.network.name.clone(),
                net_id,
                adr: AdrConfig {
                    method: scenario.network.adr_method,
                    margin_db: scenario.network.adr_margin_db,
                    history_len: scenario.network.adr_history,
                    required_snr: phy.snr_thresholds,
                },
                adr_enabled: scenario.network.adr,
                aggregation_window,
                timing,
                plan: plan.clone(),
                phy: phy.clone(),
                devices: registrations,
                gateways: gateway_names.clone(),
            },
        );
        for (time, payload) in server.initial_events() {
            push_event(SERVER_ID, time, payload);
        }
        for device in &devices {
            for (time, payload) in device.initial_events(&mut rng) {
                push_event(device.entity_id(), time, payload);
            }
        }

        entities.register(Box::new(medium));
        entities.register(Box::new(server));
        for (id, gw) in gateway_ids.iter().zip(&scenario.gateways) {
            entities.register(Box::new(Gateway::new(
                *id,
                GatewayConfig {
                    name: gw.name.clone(),
                    server: SERVER_ID,
                    medium: MEDIUM_ID,
                    tx_power_dbm: gw.tx_power_dbm,
                    backhaul_delay,
                    collision: scenario.collision.clone(),
                    phy: phy.clone(),
                },
                Arc::clone(&device_names),
            )));
        }
        for device in devices {
            entities.register(Box::new(device));
        }

        info!(
            "Built scenario: {} gateways, {} devices, {} initial events (seed {})",
            gateway_ids.len(),
            device_names.len(),
            initial_events.len(),
            self.seed
        );
        for node in &nodes {
            debug!("Entity[{}]: {:?} id {}", node.name, node.kind, node.entity_id.0);
        }

        Ok(BuiltSimulation {
            entities,
            initial_events,
            nodes,
            timing,
            aggregation_window,
        })
    }
}

/// Build a simulation from a scenario with an explicit seed.
pub fn build_simulation(scenario: &Scenario, seed: u64) -> Result<BuiltSimulation, ModelError> {
    SimulationBuilder::new(scenario).seed(seed).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"
simulation:
  seed: 3
  duration_s: 600
channel:
  environment: urban
network:
  net_id: "000013"
gateways:
  - name: gw-0
    position: { x: 0, y: 0 }
devices:
  - name: sensor
    count: 3
    activation:
      mode: otaa
      dev_eui: "0004A30B001C0000"
      join_eui: "70B3D57ED0000000"
      app_key: "2B7E151628AED2A6ABF7158809CF4F3C"
  - name: meter
    position: { x: 100, y: 50 }
    activation:
      mode: abp
      dev_addr: "26011BDA"
      nwk_skey: "2B7E151628AED2A6ABF7158809CF4F3C"
      app_skey: "3C4FCF098815F7ABA6D2AE2816157E2B"
    settings:
      spreading_factor: 7
      class: C
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BASIC.as_bytes()).unwrap();
        let scenario = load_scenario(file.path()).unwrap();
        assert_eq!(scenario.simulation.seed, 3);
        assert_eq!(scenario.devices.len(), 2);
        assert!(load_scenario(Path::new("/nonexistent/scenario.yaml")).is_err());
    }

    #[test]
    fn test_group_expansion() {
        let scenario = load_scenario_from_str(BASIC).unwrap();
        let devices = resolve_devices(&scenario).unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sensor-0", "sensor-1", "sensor-2", "meter"]);
        match &devices[2].activation {
            Activation::Otaa { dev_eui, .. } => assert_eq!(*dev_eui, Eui64(0x0004_A30B_001C_0002)),
            other => panic!("unexpected activation {:?}", other),
        }
        match &devices[3].activation {
            Activation::Abp { dev_addr, .. } => assert_eq!(*dev_addr, DevAddr(0x2601_1BDA)),
            other => panic!("unexpected activation {:?}", other),
        }
        assert_eq!(devices[3].settings.class, lorasim_mac::DeviceClass::C);
        assert_eq!(devices[0].settings.spreading_factor, 12);
    }

    #[test]
    fn test_build_allocates_ids_in_order() {
        let scenario = load_scenario_from_str(BASIC).unwrap();
        let built = build_simulation(&scenario, 3).unwrap();
        assert_eq!(built.entities.len(), 2 + 1 + 4);
        assert_eq!(built.node("medium").map(|n| n.entity_id), Some(MEDIUM_ID));
        assert_eq!(built.node("network-server").map(|n| n.entity_id), Some(SERVER_ID));
        assert_eq!(built.node("gw-0").map(|n| n.entity_id), Some(EntityId(2)));
        assert_eq!(built.node("meter").map(|n| n.entity_id), Some(EntityId(6)));
        assert_eq!(
            built.node("meter").and_then(|n| n.position),
            Some(Position::new(100.0, 50.0))
        );
        // one Generate per device
        assert_eq!(built.initial_events.len(), 4);
        assert!(built.initial_events.iter().all(|e| e.targets == vec![e.source]));
        assert_eq!(
            built.settle_time(),
            SimTime::from_millis(1200) + SimTime::from_millis(1010) + SimTime::from_millis(100)
        );
    }

    #[test]
    fn test_placement_is_seeded() {
        let scenario = load_scenario_from_str(BASIC).unwrap();
        let positions = |seed| -> Vec<Option<Position>> {
            build_simulation(&scenario, seed)
                .unwrap()
                .nodes
                .iter()
                .map(|n| n.position)
                .collect()
        };
        assert_eq!(positions(1), positions(1));
        assert_ne!(positions(1), positions(2));
        for p in positions(1).into_iter().flatten() {
            assert!((0.0..1000.0).contains(&p.x) && (0.0..1000.0).contains(&p.y));
        }
    }

    #[test]
    fn test_gateway_defaults_to_area_centre() {
        let yaml = "simulation: { area_m: 2000 }\ngateways:\n  - name: gw\n";
        let built = build_simulation(&load_scenario_from_str(yaml).unwrap(), 0).unwrap();
        assert_eq!(built.node("gw").and_then(|n| n.position), Some(Position::new(1000.0, 1000.0)));
    }

    #[test]
    fn test_rejects_duplicates_and_bad_keys() {
        let dup = BASIC.replace("name: meter", "name: sensor-1");
        assert!(matches!(load_scenario_from_str(&dup), Err(ModelError::DuplicateNode(n)) if n == "sensor-1"));

        let bad_key = BASIC.replace("\"26011BDA\"", "\"26011B\"");
        assert!(matches!(load_scenario_from_str(&bad_key), Err(ModelError::InvalidKeySpec(_))));

        let bad_hex = BASIC.replace("\"000013\"", "\"00zz13\"");
        assert!(matches!(load_scenario_from_str(&bad_hex), Err(ModelError::InvalidKeySpec(_))));
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let no_gw = "devices: []\n";
        assert!(matches!(load_scenario_from_str(no_gw), Err(ModelError::InvalidConfig(_))));

        let env = BASIC.replace("environment: urban", "environment: swamp");
        assert!(matches!(
            load_scenario_from_str(&env),
            Err(ModelError::Config(ConfigError::UnknownEnvironment(_)))
        ));

        let sf = BASIC.replace("spreading_factor: 7", "spreading_factor: 13");
        assert!(matches!(
            load_scenario_from_str(&sf),
            Err(ModelError::Config(ConfigError::InvalidSpreadingFactor(13)))
        ));

        let energy = BASIC.replace("class: C", "class: C\n      energy_profile: solar");
        assert!(matches!(
            load_scenario_from_str(&energy),
            Err(ModelError::Config(ConfigError::UnknownProfile { .. }))
        ));

        let duration = BASIC.replace("duration_s: 600", "duration_s: -1");
        assert!(matches!(load_scenario_from_str(&duration), Err(ModelError::InvalidConfig(_))));

        let typo = BASIC.replace("net_id:", "netid:");
        assert!(matches!(load_scenario_from_str(&typo), Err(ModelError::YamlError(_))));
    }

    #[test]
    fn test_duty_cycle_must_fit_worst_case_frame() {
        // SF12 frame of 48 bytes is ~2 s; 0.1% of 60 s is 60 ms
        let tight = BASIC.replace(
            "class: C",
            "class: C\n      duty_cycle: { quota: 0.001, window_s: 60 }",
        );
        assert!(matches!(load_scenario_from_str(&tight), Err(ModelError::Config(_))));
        let fine = BASIC.replace("class: C", "class: C\n      duty_cycle: { quota: 0.01 }");
        assert!(load_scenario_from_str(&fine).is_ok());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = BASIC.replace(
            "class: C",
            "class: C\n      traffic: { payload_bytes: 240 }",
        );
        assert!(matches!(load_scenario_from_str(&big), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_accelerated_without_backend_still_builds() {
        let yaml = BASIC.replace("environment: urban", "environment: urban\n  error_model: accelerated");
        let scenario = load_scenario_from_str(&yaml).unwrap();
        assert!(SimulationBuilder::new(&scenario).build().is_ok());
    }
}
