//! End device entity.
//!
//! A device turns traffic intents into uplinks, gates every emission through
//! its duty-cycle ledger, opens the receive windows of its class and applies
//! whatever the network sends back. All radio state changes are charged to
//! its energy ledger.

use crate::adr::AdrAckCounter;
use crate::duty_cycle::{DutyCycleConfig, DutyCycleError, DutyCycleLedger};
use crate::energy::{EnergyLedger, EnergyProfile, RadioState};
use crate::{ChannelPlan, DeviceClass, MacTiming, RxTiming};
use lorasim_common::metric_defs;
use lorasim_common::{
    ConfigError, Direction, Entity, EntityId, Event, EventId, EventPayload, LoraFrame, OutputEvent, OutputKind,
    RadioParams, Reception, RxWindow, RxWindowKind, SimContext, SimError, SimTime, Transmission,
};
use lorasim_phy::{time_on_air, validate_sf, LoraPhyConfig};
use lorawan_packet::crypto::derive_session_keys;
use lorawan_packet::mac::encoded_len;
use lorawan_packet::region::{dr_to_sf, tx_power_dbm};
use lorawan_packet::{
    extend_fcnt, AesKey, DataFrame, DevAddr, Eui64, FCtrl, FrameParams, JoinAccept, JoinRequest, MacCommand,
    PhyPayload, SessionKeys, MAX_FOPTS,
};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::fmt;
use tracing::{debug, info, trace};

const TIMER_BEACON_DONE: u64 = 1;
const TIMER_PING_DONE: u64 = 2;

/// Retransmission backoff bounds in seconds.
const RETRANSMIT_BACKOFF_S: (f64, f64) = (1.0, 3.0);

// ============================================================================
// Configuration
// ============================================================================

/// How a device obtains its session.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// Over-the-air activation with a root key.
    Otaa {
        dev_eui: Eui64,
        join_eui: Eui64,
        app_key: AesKey,
    },
    /// Activation by personalisation with fixed session keys.
    Abp { dev_addr: DevAddr, keys: SessionKeys },
}

/// Inter-arrival law of traffic intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficModel {
    #[default]
    Periodic,
    /// Exponential inter-arrival with mean `interval`.
    Poisson,
}

/// Uplink traffic of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficConfig {
    pub model: TrafficModel,
    /// Period, or mean inter-arrival time for Poisson traffic.
    pub interval: SimTime,
    pub payload_bytes: usize,
    pub fport: u8,
    pub confirmed: bool,
    /// First intent; drawn uniformly in `[0, interval)` when absent.
    pub first_at: Option<SimTime>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        TrafficConfig {
            model: TrafficModel::Periodic,
            interval: SimTime::from_secs(600.0),
            payload_bytes: 20,
            fport: 1,
            confirmed: false,
            first_at: None,
        }
    }
}

/// Device configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub class: DeviceClass,
    pub activation: Activation,
    pub traffic: TrafficConfig,
    pub spreading_factor: u8,
    pub tx_power_index: u8,
    /// Device runs ADR (sets the ADR bit and the ADR_ACK logic).
    pub adr: bool,
    /// Uplinks without any downlink before ADRACKReq is set.
    pub adr_ack_limit: u32,
    /// Further uplinks before reverting to `spreading_factor` and
    /// `tx_power_index`.
    pub adr_ack_delay: u32,
    /// Transmissions per frame without a downlink.
    pub nb_trans: u8,
    pub duty_cycle: Option<DutyCycleConfig>,
    pub energy: EnergyProfile,
    /// Battery capacity in joules; `None` for mains power.
    pub battery_j: Option<f64>,
    /// Stop generating after this many intents.
    pub packet_limit: Option<u64>,
    /// Class B ping-slot periodicity exponent (0..=7).
    pub ping_periodicity: u8,
    /// Add a LinkCheckReq to every n-th data uplink.
    pub link_check_interval: Option<u32>,
    pub medium: EntityId,
    pub plan: ChannelPlan,
    pub timing: MacTiming,
    pub phy: LoraPhyConfig,
}

/// Device state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Idle,
    Transmitting,
    WaitingRx1,
    Rx1,
    WaitingRx2,
    Rx2,
    /// Class C continuous reception.
    Listening,
    /// Class B beacon reception.
    BeaconSync,
    /// Class B ping slot open.
    PingSlot,
    /// Battery exhausted; the device no longer reacts.
    Depleted,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Session {
    dev_addr: DevAddr,
    keys: SessionKeys,
}

/// The frame currently being (re)transmitted.
#[derive(Debug, Clone)]
struct PendingFrame {
    bytes: Vec<u8>,
    fcnt: Option<u32>,
    confirmed: bool,
    is_join: bool,
    attempts: u8,
    spreading_factor: u8,
    tx_power_index: u8,
    acked: bool,
    downlink_seen: bool,
}

/// Receive windows following one uplink.
#[derive(Debug, Clone)]
struct RxCycle {
    rx1: RxWindow,
    rx2: RxWindow,
    events: Vec<(EventId, SimTime)>,
    rx2_closed: bool,
}

#[derive(Debug, Clone)]
struct ActiveDownlink {
    reception: Reception,
    window: RxWindowKind,
}

/// A LoRaWAN end device.
pub struct Device {
    id: EntityId,
    config: DeviceConfig,
    state: DeviceState,
    session: Option<Session>,
    dev_nonce: u16,
    join_nonce: Option<u16>,
    fcnt_up: u32,
    fcnt_down: Option<u32>,
    spreading_factor: u8,
    tx_power_index: u8,
    nb_trans: u8,
    rx_timing: RxTiming,
    intents: u64,
    generated: u64,
    data_frames: u64,
    ping_info_sent: bool,
    current: Option<PendingFrame>,
    current_tx: Option<(u64, u32, u8)>,
    pending_answers: Vec<MacCommand>,
    ack_downlink: bool,
    adr_ack: AdrAckCounter,
    duty: Option<DutyCycleLedger>,
    energy: EnergyLedger,
    cycle: Option<RxCycle>,
    active: Option<ActiveDownlink>,
    ping_window: Option<RxWindow>,
    inter_arrival: Option<Exp<f64>>,
    next_generate: Option<EventId>,
    next_beacon: Option<EventId>,
    pending_retry: Option<EventId>,
}

impl Device {
    /// Create a device, validating its radio and traffic parameters.
    pub fn new(id: EntityId, config: DeviceConfig) -> Result<Self, ConfigError> {
        validate_sf(config.spreading_factor)?;
        if tx_power_dbm(config.tx_power_index).is_none() {
            return Err(ConfigError::invalid(
                format!("{}.tx_power_index", config.name),
                format!("{} out of range", config.tx_power_index),
            ));
        }
        if config.nb_trans == 0 || config.nb_trans > 15 {
            return Err(ConfigError::invalid(
                format!("{}.nb_trans", config.name),
                "must be in 1..=15",
            ));
        }
        if config.adr_ack_limit == 0 {
            return Err(ConfigError::invalid(
                format!("{}.adr_ack_limit", config.name),
                "must be at least 1",
            ));
        }
        if config.plan.uplink_channels.is_empty() {
            return Err(ConfigError::invalid("channel.uplink_channels", "no uplink channel"));
        }
        if config.traffic.interval == SimTime::ZERO {
            return Err(ConfigError::invalid(
                format!("{}.traffic.interval", config.name),
                "must be positive",
            ));
        }
        let inter_arrival = match config.traffic.model {
            TrafficModel::Periodic => None,
            TrafficModel::Poisson => Some(
                Exp::new(1.0 / config.traffic.interval.as_secs_f64())
                    .map_err(|e| ConfigError::invalid(format!("{}.traffic.interval", config.name), e.to_string()))?,
            ),
        };
        let session = match &config.activation {
            Activation::Abp { dev_addr, keys } => Some(Session {
                dev_addr: *dev_addr,
                keys: *keys,
            }),
            Activation::Otaa { .. } => None,
        };

        let state = if config.class == DeviceClass::C {
            DeviceState::Listening
        } else {
            DeviceState::Idle
        };
        let mut energy = EnergyLedger::new(config.energy.clone(), config.battery_j);
        if state == DeviceState::Listening {
            energy.transition(RadioState::Rx, SimTime::ZERO, 0.0);
        }

        Ok(Device {
            id,
            state,
            session,
            dev_nonce: 0,
            join_nonce: None,
            fcnt_up: 0,
            fcnt_down: None,
            spreading_factor: config.spreading_factor,
            tx_power_index: config.tx_power_index,
            nb_trans: config.nb_trans,
            rx_timing: config.timing.rx,
            intents: 0,
            generated: 0,
            data_frames: 0,
            ping_info_sent: false,
            current: None,
            current_tx: None,
            pending_answers: Vec::new(),
            ack_downlink: false,
            adr_ack: AdrAckCounter::new(config.adr_ack_limit, config.adr_ack_delay),
            duty: config.duty_cycle.map(DutyCycleLedger::new),
            energy,
            cycle: None,
            active: None,
            ping_window: None,
            inter_arrival,
            next_generate: None,
            next_beacon: None,
            pending_retry: None,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.session.is_some()
    }

    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.session.map(|s| s.dev_addr)
    }

    pub fn spreading_factor(&self) -> u8 {
        self.spreading_factor
    }

    pub fn tx_power_index(&self) -> u8 {
        self.tx_power_index
    }

    /// Intents waiting for the radio.
    pub fn queued_intents(&self) -> u64 {
        self.intents
    }

    pub fn energy(&self) -> &EnergyLedger {
        &self.energy
    }

    /// Events that start this device: its first traffic intent and, for
    /// class B, the first beacon.
    pub fn initial_events<R: Rng>(&self, rng: &mut R) -> Vec<(SimTime, EventPayload)> {
        let first = self.config.traffic.first_at.unwrap_or_else(|| {
            SimTime::from_micros(rng.gen_range(0..self.config.traffic.interval.as_micros()))
        });
        let mut events = vec![(first, EventPayload::Generate)];
        if self.config.class == DeviceClass::B {
            events.push((SimTime::ZERO, EventPayload::BeaconFire));
        }
        events
    }

    fn handler_error(&self, message: impl fmt::Display) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: message.to_string(),
        }
    }

    fn idle_state(&self) -> DeviceState {
        if self.config.class == DeviceClass::C {
            DeviceState::Listening
        } else {
            DeviceState::Idle
        }
    }

    fn is_free(&self) -> bool {
        matches!(self.state, DeviceState::Idle | DeviceState::Listening) && self.cycle.is_none() && self.active.is_none()
    }

    fn radio_state(&self, state: DeviceState) -> RadioState {
        match state {
            DeviceState::Transmitting => RadioState::Tx,
            DeviceState::Rx1
            | DeviceState::Rx2
            | DeviceState::Listening
            | DeviceState::BeaconSync
            | DeviceState::PingSlot => RadioState::Rx,
            DeviceState::Idle | DeviceState::WaitingRx1 | DeviceState::WaitingRx2 => {
                if self.config.class == DeviceClass::C {
                    RadioState::Rx
                } else {
                    RadioState::Sleep
                }
            }
            DeviceState::Depleted => RadioState::Off,
        }
    }

    fn set_state(&mut self, state: DeviceState, ctx: &mut SimContext) {
        if self.state == DeviceState::Depleted {
            return;
        }
        trace!("Device[{}]: {} -> {}", self.config.name, self.state, state);
        let power = tx_power_dbm(self.tx_power_index).unwrap_or(0.0);
        let radio = self.radio_state(state);
        self.energy.transition(radio, ctx.time(), power);
        self.state = state;
        metrics::gauge!(metric_defs::DEVICE_ENERGY.name, &metric_defs::node_labels(&self.config.name))
            .set(self.energy.consumed_j());
        if self.energy.is_depleted() {
            self.deplete(ctx);
        }
    }

    fn deplete(&mut self, ctx: &mut SimContext) {
        info!(
            "Device[{}]: battery depleted after {:.3} J",
            self.config.name,
            self.energy.consumed_j()
        );
        self.energy.transition(RadioState::Off, ctx.time(), 0.0);
        self.state = DeviceState::Depleted;
        let now = ctx.time();
        if let Some(cycle) = self.cycle.take() {
            for (id, at) in cycle.events {
                if at > now {
                    ctx.cancel_event(id);
                }
            }
        }
        for id in [self.next_generate.take(), self.next_beacon.take(), self.pending_retry.take()]
            .into_iter()
            .flatten()
        {
            ctx.cancel_event(id);
        }
        self.current = None;
        self.active = None;
        self.ping_window = None;
        ctx.emit(
            OutputEvent::new(now, OutputKind::BatteryDepleted)
                .device(self.config.name.clone())
                .detail(format!("{:.3} J consumed", self.energy.consumed_j())),
        );
    }

    // ========================================================================
    // Uplink Path
    // ========================================================================

    fn handle_generate(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        self.next_generate = None;
        self.generated += 1;
        self.intents += 1;
        let more = self.config.packet_limit.map(|l| self.generated < l).unwrap_or(true);
        if more {
            let delay = match &self.inter_arrival {
                Some(exp) => SimTime::from_secs(exp.sample(ctx.rng())),
                None => self.config.traffic.interval,
            };
            self.next_generate = Some(ctx.post_event(delay, vec![self.id], EventPayload::Generate));
        }
        trace!("Device[{}]: intent queued ({} waiting)", self.config.name, self.intents);
        self.resume(ctx)
    }

    /// Send whatever is due if the radio is free.
    fn resume(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if !self.is_free() || self.pending_retry.is_some() {
            return Ok(());
        }
        if self.current.is_some() {
            return self.transmit_current(ctx);
        }
        if self.session.is_none() {
            if self.intents == 0 {
                return Ok(());
            }
            self.current = Some(self.build_join()?);
        } else if self.intents > 0 {
            self.intents -= 1;
            self.current = Some(self.build_data(ctx)?);
        } else {
            return Ok(());
        }
        self.transmit_current(ctx)
    }

    fn build_join(&mut self) -> Result<PendingFrame, SimError> {
        let Activation::Otaa {
            dev_eui,
            join_eui,
            app_key,
        } = &self.config.activation
        else {
            return Err(self.handler_error("join requested by an ABP device"));
        };
        let request =
            JoinRequest::seal(*join_eui, *dev_eui, self.dev_nonce, app_key).map_err(|e| self.handler_error(e))?;
        debug!("Device[{}]: join request, DevNonce {}", self.config.name, self.dev_nonce);
        self.join_nonce = Some(self.dev_nonce);
        self.dev_nonce = self.dev_nonce.wrapping_add(1);
        Ok(PendingFrame {
            bytes: request.encode(),
            fcnt: None,
            confirmed: false,
            is_join: true,
            attempts: 0,
            spreading_factor: self.spreading_factor,
            tx_power_index: self.tx_power_index,
            acked: false,
            downlink_seen: false,
        })
    }

    fn build_data(&mut self, ctx: &mut SimContext) -> Result<PendingFrame, SimError> {
        let Some(session) = self.session else {
            return Err(self.handler_error("data frame without session"));
        };
        self.data_frames += 1;

        if let Some(n) = self.config.link_check_interval {
            if n > 0 && self.data_frames % n as u64 == 0 {
                self.pending_answers.push(MacCommand::LinkCheckReq);
            }
        }
        if self.config.class == DeviceClass::B && !self.ping_info_sent {
            self.pending_answers.push(MacCommand::PingSlotInfoReq {
                periodicity: self.config.ping_periodicity,
            });
            self.ping_info_sent = true;
        }

        let mut payload = vec![0u8; self.config.traffic.payload_bytes];
        ctx.rng().fill(&mut payload[..]);

        // FOpts hold at most 15 bytes; the rest waits for the next uplink.
        let mut commands = Vec::new();
        while let Some(cmd) = self.pending_answers.first() {
            let mut candidate = commands.clone();
            candidate.push(cmd.clone());
            if !payload.is_empty() && encoded_len(&candidate) > MAX_FOPTS {
                break;
            }
            commands = candidate;
            self.pending_answers.remove(0);
        }

        let step = self.config.adr.then(|| self.adr_ack.on_uplink());
        let fctrl = FCtrl {
            adr: self.config.adr,
            adr_ack_req: step.map(|s| s.ack_req).unwrap_or(false),
            ack: self.ack_downlink,
            f_pending: self.config.class == DeviceClass::B,
            fopts_len: 0,
        };
        let confirmed = self.config.traffic.confirmed;
        let fcnt = self.fcnt_up;
        let frame = DataFrame::seal(
            &FrameParams {
                direction: Direction::Up,
                confirmed,
                dev_addr: session.dev_addr,
                fcnt,
                fctrl,
                fport: self.config.traffic.fport,
                payload: &payload,
                mac_commands: &commands,
            },
            &session.keys,
        )
        .map_err(|e| self.handler_error(e))?;
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
        self.ack_downlink = false;

        let pending = PendingFrame {
            bytes: frame.encode(),
            fcnt: Some(fcnt),
            confirmed,
            is_join: false,
            attempts: 0,
            spreading_factor: self.spreading_factor,
            tx_power_index: self.tx_power_index,
            acked: false,
            downlink_seen: false,
        };

        if step.map(|s| s.revert).unwrap_or(false) {
            self.adr_fallback(fcnt, ctx);
        }
        Ok(pending)
    }

    /// Back to the configured data rate and power once the network has been
    /// silent for the whole ADR_ACK back-off.
    fn adr_fallback(&mut self, fcnt: u32, ctx: &mut SimContext) {
        let (sf, power) = (self.config.spreading_factor, self.config.tx_power_index);
        info!(
            "Device[{}]: no downlink for {} uplinks, reverting SF{} power index {} -> SF{} power index {}",
            self.config.name,
            self.adr_ack.limit() + self.adr_ack.delay(),
            self.spreading_factor,
            self.tx_power_index,
            sf,
            power
        );
        self.spreading_factor = sf;
        self.tx_power_index = power;
        metrics::counter!(
            metric_defs::DEVICE_ADR_FALLBACKS.name,
            &metric_defs::node_labels(&self.config.name)
        )
        .increment(1);
        ctx.emit(
            OutputEvent::new(ctx.time(), OutputKind::AdrFallback)
                .device(self.config.name.clone())
                .fcnt(fcnt)
                .sf(sf)
                .tx_power(tx_power_dbm(power).unwrap_or(14.0)),
        );
    }

    fn transmit_current(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(frame) = self.current.as_ref() else {
            return Ok(());
        };
        let channels = &self.config.plan.uplink_channels;
        let frequency_hz = channels[ctx.rng().gen_range(0..channels.len())];
        let params = RadioParams {
            frequency_hz,
            bandwidth_hz: self.config.plan.bandwidth_hz,
            spreading_factor: frame.spreading_factor,
            coding_rate: self.config.plan.coding_rate,
            tx_power_dbm: tx_power_dbm(frame.tx_power_index).unwrap_or(14.0),
        };
        let airtime = time_on_air(&params, frame.bytes.len(), &self.config.phy);
        let now = ctx.time();
        let labels = metric_defs::node_labels(&self.config.name);

        if let Some(ledger) = self.duty.as_mut() {
            if let Err(DutyCycleError::ResourceExhausted { retry_at }) = ledger.try_reserve(now, airtime) {
                debug!(
                    "Device[{}]: duty cycle exhausted, retry at {}",
                    self.config.name, retry_at
                );
                metrics::counter!(metric_defs::DEVICE_DUTY_CYCLE_DEFERRED.name, &labels).increment(1);
                let mut out = OutputEvent::new(now, OutputKind::DutyCycleDeferred)
                    .device(self.config.name.clone())
                    .sf(params.spreading_factor)
                    .tx_power(params.tx_power_dbm)
                    .airtime(airtime)
                    .detail(format!("retry at {}", retry_at));
                if let Some(fcnt) = frame.fcnt {
                    out = out.fcnt(fcnt);
                }
                ctx.emit(out);
                self.pending_retry = Some(ctx.post_at(retry_at, vec![self.id], EventPayload::DutyCycleRefill));
                return Ok(());
            }
        }

        let Some(frame) = self.current.as_mut() else {
            return Ok(());
        };
        frame.attempts = frame.attempts.saturating_add(1);
        let attempt = frame.attempts;
        let fcnt = frame.fcnt;
        let lora_frame = LoraFrame::new(frame.bytes.clone());
        let mtype_label = lora_frame.mtype_label();

        let tx = Transmission {
            id: ctx.next_transmission_id(),
            sender: self.id,
            direction: Direction::Up,
            target: None,
            params,
            start: now,
            end: now + airtime,
            frame: lora_frame,
            attempt,
        };
        debug!(
            "Device[{}]: uplink tx {} {} at {:.1} MHz sf {} {} dBm, airtime {} (attempt {})",
            self.config.name,
            tx.id,
            mtype_label,
            frequency_hz as f64 / 1e6,
            params.spreading_factor,
            params.tx_power_dbm,
            airtime,
            attempt
        );
        let mut tx_labels = labels.to_vec();
        tx_labels.push(("mtype", mtype_label.to_string()));
        metrics::counter!(metric_defs::DEVICE_TX_PACKETS.name, &tx_labels).increment(1);
        metrics::counter!(metric_defs::DEVICE_TX_AIRTIME.name, &labels).increment(airtime.as_micros());

        if attempt > 1 {
            metrics::counter!(metric_defs::DEVICE_RETRANSMISSIONS.name, &labels).increment(1);
            let mut out = OutputEvent::new(now, OutputKind::Retransmitted)
                .device(self.config.name.clone())
                .sf(params.spreading_factor)
                .tx_power(params.tx_power_dbm)
                .airtime(airtime)
                .detail(format!("attempt {}", attempt));
            if let Some(fcnt) = fcnt {
                out = out.fcnt(fcnt);
            }
            ctx.emit(out);
        }

        self.current_tx = Some((tx.id, frequency_hz, params.spreading_factor));
        let tx_id = tx.id;
        ctx.post_immediate(vec![self.config.medium], EventPayload::TxStart(tx));
        ctx.post_event(airtime, vec![self.id], EventPayload::TxEnd { transmission_id: tx_id });
        self.enter_transmitting(params.tx_power_dbm, ctx);
        Ok(())
    }

    fn enter_transmitting(&mut self, tx_power_dbm: f64, ctx: &mut SimContext) {
        if self.state == DeviceState::Depleted {
            return;
        }
        trace!("Device[{}]: {} -> Transmitting", self.config.name, self.state);
        self.energy.transition(RadioState::Tx, ctx.time(), tx_power_dbm);
        self.state = DeviceState::Transmitting;
        if self.energy.is_depleted() {
            self.deplete(ctx);
        }
    }

    fn handle_tx_end(&mut self, transmission_id: u64, ctx: &mut SimContext) {
        let Some((id, frequency_hz, spreading_factor)) = self.current_tx else {
            return;
        };
        if id != transmission_id {
            return;
        }
        self.current_tx = None;
        let now = ctx.time();
        let plan = &self.config.plan;
        let rx1_open = now + self.rx_timing.rx1_delay;
        let rx2_open = now + self.rx_timing.rx2_delay;
        let rx1 = RxWindow {
            kind: RxWindowKind::Rx1,
            frequency_hz: plan.rx1_frequency(frequency_hz),
            spreading_factor,
            open: rx1_open,
            close: rx1_open + self.rx_timing.rx_window,
        };
        let rx2 = RxWindow {
            kind: RxWindowKind::Rx2,
            frequency_hz: plan.rx2_frequency_hz,
            spreading_factor: plan.rx2_spreading_factor,
            open: rx2_open,
            close: rx2_open + self.rx_timing.rx_window,
        };
        let mut events = Vec::with_capacity(4);
        for (at, payload) in [
            (rx1.open, EventPayload::RxWindowOpen(rx1)),
            (rx1.close, EventPayload::RxWindowClose(rx1)),
            (rx2.open, EventPayload::RxWindowOpen(rx2)),
            (rx2.close, EventPayload::RxWindowClose(rx2)),
        ] {
            events.push((ctx.post_at(at, vec![self.id], payload), at));
        }
        self.cycle = Some(RxCycle {
            rx1,
            rx2,
            events,
            rx2_closed: false,
        });
        self.set_state(DeviceState::WaitingRx1, ctx);
    }

    // ========================================================================
    // Receive Windows
    // ========================================================================

    fn handle_window_open(&mut self, window: &RxWindow, ctx: &mut SimContext) {
        if self.cycle.is_none() || self.active.is_some() {
            return;
        }
        match window.kind {
            RxWindowKind::Rx1 => self.set_state(DeviceState::Rx1, ctx),
            RxWindowKind::Rx2 => self.set_state(DeviceState::Rx2, ctx),
            _ => {}
        }
    }

    fn handle_window_close(&mut self, window: &RxWindow, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(cycle) = self.cycle.as_mut() else {
            return Ok(());
        };
        if window.kind == RxWindowKind::Rx2 {
            cycle.rx2_closed = true;
        }
        if self.active.is_some() {
            return Ok(());
        }
        match window.kind {
            RxWindowKind::Rx1 => {
                self.set_state(DeviceState::WaitingRx2, ctx);
                Ok(())
            }
            RxWindowKind::Rx2 => self.finish_cycle(ctx),
            _ => Ok(()),
        }
    }

    /// Which open window, if any, catches a downlink starting now.
    fn catching_window(&self, tx: &Transmission) -> Option<RxWindowKind> {
        let (start, freq, sf) = (tx.start, tx.params.frequency_hz, tx.params.spreading_factor);
        if let Some(cycle) = &self.cycle {
            if cycle.rx1.accepts(start, freq, sf) {
                return Some(RxWindowKind::Rx1);
            }
            if !cycle.rx2_closed && cycle.rx2.accepts(start, freq, sf) {
                return Some(RxWindowKind::Rx2);
            }
        }
        let plan = &self.config.plan;
        if self.config.class == DeviceClass::C
            && self.state != DeviceState::Transmitting
            && freq == plan.rx2_frequency_hz
            && sf == plan.rx2_spreading_factor
        {
            return Some(RxWindowKind::Rx2);
        }
        if self.state == DeviceState::PingSlot {
            if let Some(w) = &self.ping_window {
                if w.accepts(start, freq, sf) {
                    return Some(RxWindowKind::PingSlot);
                }
            }
        }
        None
    }

    fn handle_downlink_arrival(&mut self, reception: &Reception, ctx: &mut SimContext) {
        let tx = &reception.transmission;
        if self.active.is_some() {
            trace!("Device[{}]: busy, downlink tx {} missed", self.config.name, tx.id);
            return;
        }
        let Some(window) = self.catching_window(tx) else {
            debug!(
                "Device[{}]: no window open for downlink tx {} ({} at {:.3} MHz sf {})",
                self.config.name,
                tx.id,
                self.state,
                tx.params.frequency_hz as f64 / 1e6,
                tx.params.spreading_factor
            );
            return;
        };
        self.active = Some(ActiveDownlink {
            reception: reception.clone(),
            window,
        });
        if self.cycle.is_some() {
            match window {
                RxWindowKind::Rx1 => self.set_state(DeviceState::Rx1, ctx),
                _ => self.set_state(DeviceState::Rx2, ctx),
            }
        }
        ctx.post_at(
            tx.end,
            vec![self.id],
            EventPayload::ReceptionEnd {
                transmission_id: tx.id,
            },
        );
    }

    fn handle_reception_end(&mut self, transmission_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        if active.reception.transmission.id != transmission_id {
            self.active = Some(active);
            return Ok(());
        }
        let draw: f64 = ctx.rng().gen();
        let valid = if draw < active.reception.packet_error_rate {
            debug!(
                "Device[{}]: downlink tx {} lost (per {:.3})",
                self.config.name, transmission_id, active.reception.packet_error_rate
            );
            false
        } else {
            self.process_downlink(&active, ctx)?
        };

        let now = ctx.time();
        if let Some(cycle) = &self.cycle {
            if valid {
                for (id, at) in &cycle.events {
                    if *at > now {
                        ctx.cancel_event(*id);
                    }
                }
                return self.finish_cycle(ctx);
            }
            if cycle.rx2_closed {
                return self.finish_cycle(ctx);
            }
            let next = if now >= cycle.rx2.open {
                DeviceState::Rx2
            } else {
                DeviceState::WaitingRx2
            };
            self.set_state(next, ctx);
            return Ok(());
        }

        if self.state == DeviceState::PingSlot {
            let closed = self.ping_window.map(|w| now >= w.close).unwrap_or(true);
            if !closed {
                return Ok(());
            }
            self.ping_window = None;
            let idle = self.idle_state();
            self.set_state(idle, ctx);
        }
        self.resume(ctx)
    }

    fn process_downlink(&mut self, active: &ActiveDownlink, ctx: &mut SimContext) -> Result<bool, SimError> {
        let reception = &active.reception;
        let payload = match PhyPayload::decode(&reception.transmission.frame.bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!("Device[{}]: undecodable downlink: {}", self.config.name, e);
                return Ok(false);
            }
        };
        match payload {
            PhyPayload::JoinAccept(bytes) => Ok(self.accept_join(&bytes, reception, ctx)),
            PhyPayload::Data(frame) if frame.direction() == Direction::Down => {
                Ok(self.accept_data(&frame, active, ctx))
            }
            _ => Ok(false),
        }
    }

    fn accept_join(&mut self, bytes: &[u8], reception: &Reception, ctx: &mut SimContext) -> bool {
        let Activation::Otaa { app_key, .. } = &self.config.activation else {
            return false;
        };
        if self.session.is_some() {
            return false;
        }
        let Some(dev_nonce) = self.join_nonce else {
            return false;
        };
        let accept = match JoinAccept::open(bytes, app_key) {
            Ok(a) => a,
            Err(e) => {
                debug!("Device[{}]: join accept rejected: {}", self.config.name, e);
                return false;
            }
        };
        let (nwk_skey, app_skey) = derive_session_keys(app_key, accept.app_nonce, accept.net_id, dev_nonce);
        self.session = Some(Session {
            dev_addr: accept.dev_addr,
            keys: SessionKeys { nwk_skey, app_skey },
        });
        self.fcnt_up = 0;
        self.fcnt_down = None;
        self.adr_ack.on_downlink();
        self.pending_answers.clear();
        self.ping_info_sent = false;
        if let Some(frame) = self.current.as_mut() {
            frame.downlink_seen = true;
        }
        info!("Device[{}]: joined as {}", self.config.name, accept.dev_addr);
        ctx.emit(
            OutputEvent::new(ctx.time(), OutputKind::Joined)
                .device(self.config.name.clone())
                .sf(reception.transmission.params.spreading_factor)
                .signal(reception.rssi_dbm, reception.snr_db)
                .detail(format!("DevAddr {}", accept.dev_addr)),
        );
        true
    }

    fn accept_data(&mut self, frame: &DataFrame, active: &ActiveDownlink, ctx: &mut SimContext) -> bool {
        let Some(session) = self.session else {
            return false;
        };
        if frame.dev_addr != session.dev_addr {
            return false;
        }
        let fcnt = extend_fcnt(self.fcnt_down.unwrap_or(0), frame.fcnt);
        if let Some(last) = self.fcnt_down {
            if fcnt <= last {
                debug!(
                    "Device[{}]: stale downlink counter {} (last {})",
                    self.config.name, fcnt, last
                );
                return false;
            }
        }
        if let Err(e) = frame.verify_mic(&session.keys.nwk_skey, fcnt) {
            debug!("Device[{}]: downlink rejected: {}", self.config.name, e);
            ctx.emit(
                OutputEvent::new(ctx.time(), OutputKind::SecurityRejected)
                    .device(self.config.name.clone())
                    .fcnt(fcnt)
                    .detail(e.to_string()),
            );
            return false;
        }
        self.fcnt_down = Some(fcnt);

        let commands = frame.mac_commands(&session.keys, fcnt).unwrap_or_else(|e| {
            debug!("Device[{}]: bad MAC commands in downlink: {}", self.config.name, e);
            Vec::new()
        });
        for cmd in &commands {
            self.apply_command(cmd, &active.reception);
        }
        let app_bytes = frame.application_payload(&session.keys, fcnt).len();

        if let Some(current) = self.current.as_mut() {
            current.downlink_seen = true;
            if frame.fctrl.ack && current.confirmed {
                current.acked = true;
            }
        }
        if frame.mtype.is_confirmed() {
            self.ack_downlink = true;
        }
        self.adr_ack.on_downlink();

        let label = match active.window {
            RxWindowKind::Rx1 => "rx1",
            RxWindowKind::Rx2 => "rx2",
            RxWindowKind::PingSlot => "ping_slot",
            RxWindowKind::Beacon => "beacon",
        };
        let mut labels = metric_defs::node_labels(&self.config.name).to_vec();
        labels.push(("window", label.to_string()));
        metrics::counter!(metric_defs::DEVICE_DOWNLINKS_RECEIVED.name, &labels).increment(1);
        debug!(
            "Device[{}]: downlink fcnt {} in {} ({} MAC commands, {} bytes, ack {})",
            self.config.name,
            fcnt,
            label,
            commands.len(),
            app_bytes,
            frame.fctrl.ack
        );
        let reception = &active.reception;
        ctx.emit(
            OutputEvent::new(ctx.time(), OutputKind::DownlinkReceived)
                .device(self.config.name.clone())
                .fcnt(fcnt)
                .sf(reception.transmission.params.spreading_factor)
                .signal(reception.rssi_dbm, reception.snr_db)
                .detail(format!("{}: {} MAC commands, {} bytes", label, commands.len(), app_bytes)),
        );
        true
    }

    fn apply_command(&mut self, cmd: &MacCommand, reception: &Reception) {
        match cmd {
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                ch_mask,
                redundancy,
            } => {
                let new_sf = dr_to_sf(*data_rate);
                let power_ack = tx_power_dbm(*tx_power).is_some();
                let channel_mask_ack = *ch_mask != 0;
                if let (Some(sf), true, true) = (new_sf, power_ack, channel_mask_ack) {
                    debug!(
                        "Device[{}]: LinkADRReq SF{} -> SF{}, power index {} -> {}",
                        self.config.name, self.spreading_factor, sf, self.tx_power_index, tx_power
                    );
                    self.spreading_factor = sf;
                    self.tx_power_index = *tx_power;
                    let nb = redundancy & 0x0F;
                    if nb > 0 {
                        self.nb_trans = nb;
                    }
                }
                self.pending_answers.push(MacCommand::LinkAdrAns {
                    power_ack,
                    data_rate_ack: new_sf.is_some(),
                    channel_mask_ack,
                });
            }
            MacCommand::DevStatusReq => {
                let threshold = self
                    .config
                    .phy
                    .snr_threshold(reception.transmission.params.spreading_factor)
                    .unwrap_or(0.0);
                let margin = (reception.snr_db - threshold).round().clamp(-32.0, 31.0) as i8;
                self.pending_answers.push(MacCommand::DevStatusAns {
                    battery: self.energy.battery_level(),
                    margin,
                });
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => {
                if let Some(ledger) = self.duty.as_mut() {
                    ledger.set_max_aggregated(*max_duty_cycle);
                }
                self.pending_answers.push(MacCommand::DutyCycleAns);
            }
            MacCommand::RxTimingSetupReq { delay } => {
                let seconds = (delay & 0x0F).max(1) as f64;
                self.rx_timing.rx1_delay = SimTime::from_secs(seconds);
                self.rx_timing.rx2_delay = SimTime::from_secs(seconds + 1.0);
                self.pending_answers.push(MacCommand::RxTimingSetupAns);
            }
            MacCommand::AdrParamSetupReq { limit_exp, delay_exp } => {
                // exponents above 15 cannot be encoded
                let limit = 1u32 << (limit_exp & 0x0F);
                let delay = 1u32 << (delay_exp & 0x0F);
                debug!(
                    "Device[{}]: ADR_ACK_LIMIT {} ADR_ACK_DELAY {}",
                    self.config.name, limit, delay
                );
                self.adr_ack.set_params(limit, delay);
                self.pending_answers.push(MacCommand::AdrParamSetupAns);
            }
            MacCommand::LinkCheckAns { margin, gateway_count } => {
                debug!(
                    "Device[{}]: link check margin {} dB via {} gateways",
                    self.config.name, margin, gateway_count
                );
            }
            MacCommand::DeviceTimeAns { seconds, fraction } => {
                debug!("Device[{}]: network time {}+{}/256 s", self.config.name, seconds, fraction);
            }
            MacCommand::PingSlotInfoAns => {
                trace!("Device[{}]: ping slot periodicity confirmed", self.config.name);
            }
            other => {
                trace!("Device[{}]: ignoring {}", self.config.name, other.as_label());
            }
        }
    }

    /// Close the receive cycle of the current frame and decide what's next.
    fn finish_cycle(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        self.cycle = None;
        if let Some(frame) = self.current.take() {
            let done = if frame.is_join {
                self.session.is_some()
            } else if frame.confirmed {
                frame.acked
            } else {
                frame.downlink_seen
            };
            let retry = !done && (frame.is_join || frame.attempts < self.nb_trans);
            if retry {
                let (lo, hi) = RETRANSMIT_BACKOFF_S;
                let backoff = SimTime::from_secs(ctx.rng().gen_range(lo..hi));
                if frame.is_join {
                    trace!("Device[{}]: no join accept, retrying in {}", self.config.name, backoff);
                } else {
                    self.current = Some(frame);
                }
                self.pending_retry = Some(ctx.post_event(backoff, vec![self.id], EventPayload::Retransmit));
            }
        }
        let idle = self.idle_state();
        self.set_state(idle, ctx);
        self.resume(ctx)
    }

    // ========================================================================
    // Class B
    // ========================================================================

    fn handle_beacon(&mut self, ctx: &mut SimContext) {
        let timing = self.config.timing.class_b;
        let now = ctx.time();
        self.next_beacon = Some(ctx.post_event(timing.beacon_interval, vec![self.id], EventPayload::BeaconFire));

        let frequency_hz = self.config.plan.ping_slot_frequency();
        let spreading_factor = self.config.plan.rx2_spreading_factor;
        for slot in timing.ping_slots(now, self.config.ping_periodicity) {
            let window = RxWindow {
                kind: RxWindowKind::PingSlot,
                frequency_hz,
                spreading_factor,
                open: slot,
                close: slot + self.rx_timing.rx_window,
            };
            ctx.post_at(slot, vec![self.id], EventPayload::PingSlot(window));
        }

        if self.is_free() {
            self.set_state(DeviceState::BeaconSync, ctx);
            ctx.post_event(
                timing.beacon_rx,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_BEACON_DONE,
                },
            );
        } else {
            debug!("Device[{}]: busy ({}), beacon missed", self.config.name, self.state);
        }
    }

    fn handle_ping_slot(&mut self, window: &RxWindow, ctx: &mut SimContext) {
        if !self.is_free() {
            return;
        }
        self.ping_window = Some(*window);
        self.set_state(DeviceState::PingSlot, ctx);
        ctx.post_at(
            window.close,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_PING_DONE,
            },
        );
    }

    fn handle_timer(&mut self, timer_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        match timer_id {
            TIMER_BEACON_DONE if self.state == DeviceState::BeaconSync => {
                let idle = self.idle_state();
                self.set_state(idle, ctx);
                self.resume(ctx)
            }
            TIMER_PING_DONE if self.state == DeviceState::PingSlot && self.active.is_none() => {
                self.ping_window = None;
                let idle = self.idle_state();
                self.set_state(idle, ctx);
                self.resume(ctx)
            }
            _ => Ok(()),
        }
    }
}

impl Entity for Device {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state == DeviceState::Depleted {
            return Ok(());
        }
        match &event.payload {
            EventPayload::Generate => self.handle_generate(ctx)?,
            EventPayload::Retransmit | EventPayload::DutyCycleRefill => {
                if self.pending_retry == Some(event.id) {
                    self.pending_retry = None;
                }
                self.resume(ctx)?;
            }
            EventPayload::TxEnd { transmission_id } => self.handle_tx_end(*transmission_id, ctx),
            EventPayload::RxWindowOpen(window) => self.handle_window_open(window, ctx),
            EventPayload::RxWindowClose(window) => self.handle_window_close(window, ctx)?,
            EventPayload::DownlinkArrival(reception) => self.handle_downlink_arrival(reception, ctx),
            EventPayload::ReceptionEnd { transmission_id } => self.handle_reception_end(*transmission_id, ctx)?,
            EventPayload::BeaconFire => self.handle_beacon(ctx),
            EventPayload::PingSlot(window) => self.handle_ping_slot(window, ctx),
            EventPayload::Timer { timer_id } => self.handle_timer(*timer_id, ctx)?,
            _ => {}
        }
        Ok(())
    }
}
