//! # lorasim-common
//!
//! Shared vocabulary of the LoRaWAN network simulator: the microsecond clock
//! ([`SimTime`]), positions and [`mobility`], entity ids, the event queue
//! entries ([`Event`], [`EventPayload`]) and the [`SimContext`] that every
//! [`Entity`] handler receives. Observable outcomes are reported as
//! [`output`] records and counted under the names in [`metric_defs`].

pub mod metric_defs;
pub mod mobility;
pub mod output;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::error;

pub use lorawan_packet::{DevAddr, Direction, Eui64, MType};
pub use output::{OutputEvent, OutputKind};

// ============================================================================
// Error Types
// ============================================================================

/// Invalid or missing configuration. Always fatal, always at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Unknown propagation environment preset.
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// Spreading factor outside 7..=12.
    #[error("Invalid spreading factor: {0} (expected 7..=12)")]
    InvalidSpreadingFactor(u8),

    /// Distance below zero.
    #[error("Negative distance: {0} m")]
    NegativeDistance(f64),

    /// Unknown named profile (energy, error model, ...).
    #[error("Unknown {kind} profile: {name}")]
    UnknownProfile {
        /// Profile family.
        kind: &'static str,
        /// Requested name.
        name: String,
    },

    /// Any other parameter out of range.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidParameter`].
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that stop a run.
#[derive(Debug, Error)]
pub enum SimError {
    /// An event targeted an id with no registered entity.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Configuration error surfaced while building.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cancellation of an event that cannot be cancelled.
    #[error("Scheduling conflict on event {event:?}: {reason}")]
    SchedulingConflict {
        /// Event that was targeted.
        event: EventId,
        /// Why the request was refused.
        reason: String,
    },

    /// A time value was negative or not finite.
    #[error("Negative or non-finite time: {0}")]
    NegativeTime(f64),

    /// An event was popped with a timestamp before the clock.
    #[error("Time reversal: event at {event_us} us, clock at {clock_us} us")]
    TimeReversal {
        /// Event timestamp.
        event_us: u64,
        /// Current clock.
        clock_us: u64,
    },

    /// A handler gave up on an event it could not process.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Microseconds since the run started. All scheduling happens on this grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Whole milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Rounds to the nearest microsecond; negative input clamps to zero.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0).round().max(0.0) as u64)
    }

    /// Like [`SimTime::from_secs`] but errors on negative or non-finite input.
    pub fn try_from_secs(s: f64) -> Result<Self, SimError> {
        if !s.is_finite() || s < 0.0 {
            return Err(SimError::NegativeTime(s));
        }
        Ok(Self::from_secs(s))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Truncated to whole milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// `None` on overflow. The `+` operator saturates instead.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// `None` if `duration` is later than `self`.
    pub fn checked_sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Position Types
// ============================================================================

/// Cartesian position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// East offset in meters.
    pub x: f64,
    /// North offset in meters.
    pub y: f64,
    /// Altitude in meters (optional).
    #[serde(default)]
    pub z: Option<f64>,
}

impl Position {
    /// Create a planar position.
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y, z: None }
    }

    /// Create a position with altitude.
    pub fn with_altitude(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z: Some(z) }
    }

    /// Distance to another position in meters.
    ///
    /// Uses 3D distance when both ends carry an altitude, 2D otherwise.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = match (self.z, other.z) {
            (Some(a), Some(b)) => a - b,
            _ => 0.0,
        };
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Linear interpolation towards `other` (`t` in 0..=1).
    pub fn lerp(&self, other: &Position, t: f64) -> Position {
        let z = match (self.z, other.z) {
            (Some(a), Some(b)) => Some(a + (b - a) * t),
            (a, b) => a.or(b),
        };
        Position {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            z,
        }
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Handle of a device, gateway or server inside one run. Assigned in
/// scenario order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// Radio Types
// ============================================================================

/// LoRa radio parameters of one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadioParams {
    /// Frequency in Hz.
    pub frequency_hz: u32,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Coding rate (1-4, representing 4/5 to 4/8).
    pub coding_rate: u8,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
}

/// PHYPayload bytes with the message type decoded up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraFrame {
    /// Raw PHYPayload.
    pub bytes: Vec<u8>,
    #[serde(skip)]
    mtype: Option<MType>,
}

impl LoraFrame {
    /// Wrap PHYPayload bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        let mtype = bytes.first().and_then(|b| MType::from_mhdr(*b).ok());
        LoraFrame { bytes, mtype }
    }

    /// Message type, if the MHDR is valid.
    pub fn mtype(&self) -> Option<MType> {
        self.mtype
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length frame.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Message type label for metrics.
    pub fn mtype_label(&self) -> &'static str {
        self.mtype.map(|m| m.as_label()).unwrap_or("unknown")
    }
}

/// A transmission on air. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    /// Unique transmission ID.
    pub id: u64,
    /// Transmitting radio entity.
    pub sender: EntityId,
    /// Uplink or downlink.
    pub direction: Direction,
    /// Intended receiver for downlinks.
    pub target: Option<EntityId>,
    /// Radio parameters.
    pub params: RadioParams,
    /// First preamble symbol on air.
    pub start: SimTime,
    /// Last symbol on air (`start + airtime`).
    pub end: SimTime,
    /// The frame being sent.
    pub frame: LoraFrame,
    /// 1 for a first transmission, higher for retransmissions.
    pub attempt: u8,
}

impl Transmission {
    /// Time on air.
    pub fn airtime(&self) -> SimTime {
        self.end - self.start
    }
}

/// A transmission as seen by one receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    /// The transmission.
    pub transmission: Transmission,
    /// Receiving entity.
    pub receiver: EntityId,
    /// Received power in dBm.
    pub rssi_dbm: f64,
    /// Signal-to-noise ratio in dB.
    pub snr_db: f64,
    /// Packet error probability of the link, ignoring interference.
    pub packet_error_rate: f64,
}

/// Which receive opportunity a window belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RxWindowKind {
    /// First window after an uplink.
    Rx1,
    /// Second window after an uplink.
    Rx2,
    /// Class B ping slot.
    PingSlot,
    /// Class B beacon reception.
    Beacon,
}

/// A receive window opened by a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RxWindow {
    /// Window kind.
    pub kind: RxWindowKind,
    /// Listening frequency.
    pub frequency_hz: u32,
    /// Listening spreading factor.
    pub spreading_factor: u8,
    /// Window opening time.
    pub open: SimTime,
    /// Window closing time (preamble must start before this).
    pub close: SimTime,
}

impl RxWindow {
    /// True if a downlink starting at `start` with these parameters is caught.
    pub fn accepts(&self, start: SimTime, frequency_hz: u32, spreading_factor: u8) -> bool {
        start >= self.open
            && start <= self.close
            && frequency_hz == self.frequency_hz
            && spreading_factor == self.spreading_factor
    }
}

/// Uplink delivered from a gateway to the network server.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkForward {
    /// Forwarding gateway.
    pub gateway: EntityId,
    /// Reception as demodulated by that gateway.
    pub reception: Reception,
}

/// Key under which the network server deduplicates uplink copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DedupKey {
    /// Data frame.
    Data {
        /// Device address.
        dev_addr: DevAddr,
        /// Frame counter as carried on air.
        fcnt: u16,
    },
    /// Join request.
    Join {
        /// Device EUI.
        dev_eui: Eui64,
        /// Device nonce.
        dev_nonce: u16,
    },
}

// ============================================================================
// Event Types
// ============================================================================

/// Sequence number handed out by [`SimContext::next_event_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Something scheduled to happen to `targets` at `time`.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID; also the FIFO sequence among simultaneous events.
    pub id: EventId,
    /// When it fires.
    pub time: SimTime,
    /// Entity that created the event (its owner).
    pub source: EntityId,
    /// Receivers, in dispatch order.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: invert so the earliest, then lowest id, pops first
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// What an event means to the entities that receive it.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Device Traffic ===========
    /// Traffic generator fired: one new transmit intent.
    Generate,
    /// NbTrans / confirmed-frame retransmission backoff elapsed.
    Retransmit,
    /// Duty-cycle budget should be available again.
    DutyCycleRefill,

    // =========== Radio Layer ===========
    /// A radio started transmitting (directed to the medium).
    TxStart(Transmission),
    /// Own transmission finished (sender to itself).
    TxEnd {
        /// Transmission that ended.
        transmission_id: u64,
    },
    /// An uplink reaches a gateway (medium to gateway).
    ReceptionStart(Reception),
    /// A downlink reaches its target device (medium to device).
    DownlinkArrival(Reception),
    /// A tracked reception has ended (receiver to itself).
    ReceptionEnd {
        /// Transmission that ended.
        transmission_id: u64,
    },

    // =========== Receive Windows ===========
    /// Device opens a receive window.
    RxWindowOpen(RxWindow),
    /// Device closes a receive window.
    RxWindowClose(RxWindow),
    /// Class B beacon period boundary.
    BeaconFire,
    /// Class B ping slot starts.
    PingSlot(RxWindow),

    // =========== Network Server ===========
    /// Gateway forwards a demodulated uplink.
    UplinkForward(UplinkForward),
    /// Deduplication window for an uplink closes.
    AggregationClose(DedupKey),
    /// Re-run ADR for a device.
    AdrEvaluate {
        /// Device address.
        dev_addr: DevAddr,
    },
    /// Try to send queued downlinks to a device.
    DownlinkOpportunity {
        /// Device address.
        dev_addr: DevAddr,
    },
    /// Server asks a gateway to transmit a downlink now.
    DownlinkTx(Transmission),

    // =========== Scheduling ===========
    /// Generic wake-up an entity set for itself.
    Timer {
        /// Owner-chosen tag.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// Stops the event loop once dispatched.
    SimulationEnd,
}

impl EventPayload {
    /// Short kind label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Generate => "generate",
            EventPayload::Retransmit => "retransmit",
            EventPayload::DutyCycleRefill => "duty_cycle_refill",
            EventPayload::TxStart(_) => "tx_start",
            EventPayload::TxEnd { .. } => "tx_end",
            EventPayload::ReceptionStart(_) => "reception_start",
            EventPayload::DownlinkArrival(_) => "downlink_arrival",
            EventPayload::ReceptionEnd { .. } => "reception_end",
            EventPayload::RxWindowOpen(_) => "rx_window_open",
            EventPayload::RxWindowClose(_) => "rx_window_close",
            EventPayload::BeaconFire => "beacon_fire",
            EventPayload::PingSlot(_) => "ping_slot",
            EventPayload::UplinkForward(_) => "uplink_forward",
            EventPayload::AggregationClose(_) => "aggregation_close",
            EventPayload::AdrEvaluate { .. } => "adr_evaluate",
            EventPayload::DownlinkOpportunity { .. } => "downlink_opportunity",
            EventPayload::DownlinkTx(_) => "downlink_tx",
            EventPayload::Timer { .. } => "timer",
            EventPayload::SimulationEnd => "simulation_end",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Handed to every [`Entity::handle_event`] call.
///
/// Holds the clock, the single seeded random stream and the buffers through
/// which handlers schedule, cancel and report.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    pending_cancellations: Vec<(EventId, EntityId)>,
    outputs: Vec<OutputEvent>,
    next_event_id: u64,
    next_transmission_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Fresh context at time zero with its random stream seeded from `seed`.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            pending_cancellations: Vec::new(),
            outputs: Vec::new(),
            next_event_id: 0,
            next_transmission_id: 0,
            source_entity: EntityId(0),
        }
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    /// The run's only source of randomness.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Advances the clock. Only the event loop calls this.
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Marks which entity the next handler call runs as.
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Post an event to occur after a delay. Returns its ID for cancellation.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id());
        let event = Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.pending_events.push(event);
        id
    }

    /// Post an event at an absolute time (clamped to now).
    pub fn post_at(&mut self, at: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let delay = at - self.time;
        self.post_event(delay, targets, payload)
    }

    /// Schedules at the current instant, after anything already queued for it.
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Ask the scheduler to cancel an event created by the current entity.
    pub fn cancel_event(&mut self, id: EventId) {
        self.pending_cancellations.push((id, self.source_entity));
    }

    /// Reports an observable outcome to the output recorder.
    pub fn emit(&mut self, event: OutputEvent) {
        self.outputs.push(event);
    }

    /// Drains events scheduled since the last call.
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Drains cancellation requests as `(event, requester)` pairs.
    pub fn take_cancellations(&mut self) -> Vec<(EventId, EntityId)> {
        std::mem::take(&mut self.pending_cancellations)
    }

    /// Drains outputs reported since the last call.
    pub fn take_outputs(&mut self) -> Vec<OutputEvent> {
        std::mem::take(&mut self.outputs)
    }

    /// Reserves an event id. Ids double as the FIFO tie-break, so every
    /// scheduled event must take one from here.
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Allocate a transmission ID.
    pub fn next_transmission_id(&mut self) -> u64 {
        let id = self.next_transmission_id;
        self.next_transmission_id += 1;
        id
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Something that receives events: a device, a gateway, the network server
/// or the radio medium.
pub trait Entity: Send {
    fn entity_id(&self) -> EntityId;

    /// React to `event`. Follow-up events, cancellations and outputs go
    /// through `ctx`; an `Err` aborts the run.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Owns every entity of a run, keyed by id.
///
/// Ordered by id so that walking the registry is reproducible across runs.
#[derive(Default)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entity` under its own id, replacing any previous holder.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        self.entities.insert(entity.entity_id(), entity);
    }

    /// Hands `event` to each target in order, stopping at the first failure.
    /// A target that was never registered is an error.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for &target in &event.targets {
            let Some(entity) = self.entities.get_mut(&target) else {
                error!("no entity {:?} for {} event", target, event.payload.kind());
                return Err(SimError::EntityNotFound(target));
            };
            ctx.set_source(target);
            entity.handle_event(event, ctx)?;
        }
        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_rounds_to_microseconds() {
        // 1.0101 s is the RX2 offset plus a window: must not drift
        assert_eq!(SimTime::from_secs(1.0101).as_micros(), 1_010_100);
        assert_eq!(SimTime::from_secs(0.0000004), SimTime::ZERO);
        assert_eq!(SimTime::from_secs(-3.0), SimTime::ZERO);
        assert_eq!(SimTime::from_micros(2_999).as_millis(), 2);
        assert_eq!(format!("{}", SimTime::from_millis(1_250)), "1.250000s");
    }

    #[test]
    fn test_sim_time_saturates_but_checked_ops_report() {
        let early = SimTime::from_millis(40);
        let late = SimTime::from_secs(2.0);
        assert_eq!(late - early, SimTime::from_micros(1_960_000));
        assert_eq!(early - late, SimTime::ZERO);
        assert_eq!(early.checked_sub(late), None);
        assert_eq!(SimTime::MAX + early, SimTime::MAX);
        assert_eq!(SimTime::MAX.checked_add(early), None);
    }

    struct Echo {
        id: EntityId,
        seen: u32,
    }

    impl Entity for Echo {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn handle_event(&mut self, _event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
            self.seen += 1;
            assert_eq!(ctx.source(), self.id);
            ctx.post_immediate(vec![], EventPayload::Generate);
            Ok(())
        }
    }

    #[test]
    fn test_registry_dispatch_and_missing_target() {
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(Echo { id: EntityId(2), seen: 0 }));
        registry.register(Box::new(Echo { id: EntityId(1), seen: 0 }));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(EntityId(1)));

        let mut ctx = SimContext::new(0);
        let mut event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(0),
            targets: vec![EntityId(1), EntityId(2)],
            payload: EventPayload::Generate,
        };
        registry.dispatch_event(&event, &mut ctx).unwrap();
        assert_eq!(ctx.take_pending_events().len(), 2);

        event.targets = vec![EntityId(9)];
        assert!(matches!(
            registry.dispatch_event(&event, &mut ctx),
            Err(SimError::EntityNotFound(EntityId(9)))
        ));
    }

    #[test]
    fn test_negative_time_rejected() {
        assert!(matches!(SimTime::try_from_secs(-1.0), Err(SimError::NegativeTime(_))));
        assert!(SimTime::try_from_secs(f64::NAN).is_err());
        assert_eq!(SimTime::try_from_secs(0.25).unwrap(), SimTime::from_millis(250));
    }

    #[test]
    fn test_position_distance_2d_and_3d() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3.0, 4.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-9);

        let c = Position::with_altitude(0.0, 0.0, 0.0);
        let d = Position::with_altitude(0.0, 3.0, 4.0);
        assert!((c.distance_to(&d) - 5.0).abs() < 1e-9);

        // Altitude only counts when both ends have one.
        let e = Position::new(0.0, 3.0);
        assert!((c.distance_to(&e) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_event_ordering_is_time_then_fifo() {
        use std::collections::BinaryHeap;
        let mk = |id: u64, t: u64| Event {
            id: EventId(id),
            time: SimTime::from_micros(t),
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::Generate,
        };
        let mut heap = BinaryHeap::new();
        heap.push(mk(3, 10));
        heap.push(mk(1, 10));
        heap.push(mk(2, 5));
        heap.push(mk(0, 10));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.id.0).collect();
        assert_eq!(order, vec![2, 0, 1, 3]);
    }

    #[test]
    fn test_context_ids_are_monotonic() {
        let mut ctx = SimContext::new(1);
        let a = ctx.post_immediate(vec![EntityId(1)], EventPayload::Generate);
        let b = ctx.post_event(SimTime::from_millis(1), vec![EntityId(1)], EventPayload::Generate);
        assert!(b.0 > a.0);
        ctx.set_source(EntityId(7));
        ctx.cancel_event(a);
        assert_eq!(ctx.take_cancellations(), vec![(a, EntityId(7))]);
        assert_eq!(ctx.take_pending_events().len(), 2);
    }

    #[test]
    fn test_rx_window_accepts() {
        let w = RxWindow {
            kind: RxWindowKind::Rx1,
            frequency_hz: 868_100_000,
            spreading_factor: 9,
            open: SimTime::from_millis(100),
            close: SimTime::from_millis(200),
        };
        assert!(w.accepts(SimTime::from_millis(150), 868_100_000, 9));
        assert!(!w.accepts(SimTime::from_millis(250), 868_100_000, 9));
        assert!(!w.accepts(SimTime::from_millis(150), 868_300_000, 9));
        assert!(!w.accepts(SimTime::from_millis(150), 868_100_000, 10));
    }

    #[test]
    fn test_lora_frame_label() {
        let frame = LoraFrame::new(vec![0x40, 1, 2, 3]);
        assert_eq!(frame.mtype(), Some(MType::UnconfirmedDataUp));
        assert_eq!(frame.mtype_label(), "unconfirmed_up");
        assert_eq!(LoraFrame::new(vec![0xFF]).mtype_label(), "unknown");
    }
}
