//! # lorasim-runner
//!
//! Drives a built LoRaWAN simulation: the event [`Scheduler`], the
//! [`EventLoop`] with its [`EndCondition`]s, run statistics and the recorded
//! output stream.
//!
//! ```rust,ignore
//! let scenario = lorasim_runner::load_scenario(Path::new("scenario.yaml"))?;
//! let stats = lorasim_runner::run_scenario(&scenario, Some(Box::new(std::io::stdout())))?;
//! println!("delivery ratio {:.3}", stats.delivery_ratio);
//! ```
//!
//! Runs are single-threaded and reproducible: the same scenario and seed
//! produce the same dispatch sequence and a byte-identical output stream.

pub mod logging;
pub mod metrics_export;
pub mod scheduler;

use lorasim_common::metric_defs;
use lorasim_common::{
    Direction, EntityId, Event, EventId, EventPayload, MType, OutputEvent, OutputKind, SimContext, SimError,
    Transmission,
};
use lorasim_model::{NodeKind, Scenario};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub use lorasim_common::SimTime;
pub use lorasim_model::{
    build_simulation, load_scenario, load_scenario_from_str, BuiltSimulation, SimulationBuilder,
};
pub use metrics_export::{install_recorder, InMemoryRecorder, MetricsSnapshot};
pub use scheduler::Scheduler;

/// Id of the end-of-run sentinel. Sorts after every real event at its time.
const END_EVENT_ID: EventId = EventId(u64::MAX);
/// Owner of the sentinel; no entity has this id.
const END_EVENT_OWNER: EntityId = EntityId(u64::MAX);

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] lorasim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// End Conditions
// ============================================================================

/// When a run stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCondition {
    /// Stop at this simulated time. Events at exactly that time still run.
    Duration(SimTime),
    /// Stop once the n-th first-attempt data uplink has started and its
    /// consequences (aggregation, reply, both receive windows) have settled.
    PacketCount(u64),
    /// Run until no events are left.
    QueueExhausted,
}

impl EndCondition {
    /// End condition of a scenario: packet limit, else duration, else queue
    /// exhaustion.
    pub fn from_scenario(scenario: &Scenario) -> Result<Self, RunnerError> {
        let sim = &scenario.simulation;
        if let Some(n) = sim.packet_limit {
            return Ok(EndCondition::PacketCount(n));
        }
        match sim.duration_s {
            Some(d) => Ok(EndCondition::Duration(SimTime::try_from_secs(d)?)),
            None => Ok(EndCondition::QueueExhausted),
        }
    }
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-device counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStats {
    /// Every uplink put on air, retransmissions and join requests included.
    pub uplinks_sent: u64,
    /// First attempts of data frames.
    pub data_uplinks: u64,
    pub delivered: u64,
    /// Gateway copies destroyed by interference.
    pub collided: u64,
    /// Copies lost to sensitivity or bit errors.
    pub lost: u64,
    pub duty_cycle_deferred: u64,
    pub retransmitted: u64,
    pub downlinks_received: u64,
    pub adr_commands: u64,
    pub joins: u64,
    pub security_rejected: u64,
    pub adr_fallbacks: u64,
    pub battery_depleted: bool,
}

/// Statistics collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Total events dispatched.
    pub total_events: u64,
    pub uplinks_sent: u64,
    pub data_uplinks: u64,
    pub delivered: u64,
    pub collided: u64,
    pub lost: u64,
    pub duty_cycle_deferred: u64,
    pub retransmitted: u64,
    pub downlinks_received: u64,
    pub adr_commands: u64,
    pub joins: u64,
    pub join_rejected: u64,
    pub security_rejected: u64,
    pub adr_fallbacks: u64,
    pub battery_depleted: u64,
    /// Delivered frames over first-attempt data uplinks.
    pub delivery_ratio: f64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
    /// Per-device breakdown keyed by device name.
    pub devices: BTreeMap<String, DeviceStats>,
}

impl SimulationStats {
    fn device(&mut self, name: Option<&String>) -> Option<&mut DeviceStats> {
        name.map(|n| self.devices.entry(n.clone()).or_default())
    }

    fn record_output(&mut self, out: &OutputEvent) {
        let device = out.device.as_ref();
        match out.kind {
            OutputKind::Delivered => {
                self.delivered += 1;
                if let Some(d) = self.device(device) {
                    d.delivered += 1;
                }
            }
            OutputKind::Collided => {
                self.collided += 1;
                if let Some(d) = self.device(device) {
                    d.collided += 1;
                }
            }
            OutputKind::Lost => {
                self.lost += 1;
                if let Some(d) = self.device(device) {
                    d.lost += 1;
                }
            }
            OutputKind::DutyCycleDeferred => {
                self.duty_cycle_deferred += 1;
                if let Some(d) = self.device(device) {
                    d.duty_cycle_deferred += 1;
                }
            }
            OutputKind::AdrCommandSent => {
                self.adr_commands += 1;
                if let Some(d) = self.device(device) {
                    d.adr_commands += 1;
                }
            }
            OutputKind::Joined => {
                self.joins += 1;
                if let Some(d) = self.device(device) {
                    d.joins += 1;
                }
            }
            OutputKind::JoinRejected => self.join_rejected += 1,
            OutputKind::SecurityRejected => {
                self.security_rejected += 1;
                if let Some(d) = self.device(device) {
                    d.security_rejected += 1;
                }
            }
            OutputKind::DownlinkReceived => {
                self.downlinks_received += 1;
                if let Some(d) = self.device(device) {
                    d.downlinks_received += 1;
                }
            }
            OutputKind::Retransmitted => {
                self.retransmitted += 1;
                if let Some(d) = self.device(device) {
                    d.retransmitted += 1;
                }
            }
            OutputKind::AdrFallback => {
                self.adr_fallbacks += 1;
                if let Some(d) = self.device(device) {
                    d.adr_fallbacks += 1;
                }
            }
            OutputKind::BatteryDepleted => {
                self.battery_depleted += 1;
                if let Some(d) = self.device(device) {
                    d.battery_depleted = true;
                }
            }
        }
    }

    fn finalize(&mut self) {
        self.delivery_ratio = if self.data_uplinks == 0 {
            0.0
        } else {
            self.delivered as f64 / self.data_uplinks as f64
        };
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// End time, when the end condition fixes one.
    pub target_time: Option<SimTime>,
    /// Elapsed wall clock time since start.
    pub wall_elapsed: Duration,
    /// Total events processed so far.
    pub events_processed: u64,
    /// Simulated seconds per wall-clock second since the last report.
    pub time_multiplier: f64,
    /// Progress as a percentage, when the end time is known.
    pub progress_percent: Option<f64>,
}

// ============================================================================
// Output Recording
// ============================================================================

/// Collects the output event stream and writes it as JSON at the end of a run.
pub struct OutputRecorder {
    output: Option<Box<dyn Write>>,
    events: Vec<OutputEvent>,
}

impl OutputRecorder {
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        OutputRecorder {
            output,
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, event: OutputEvent) {
        self.events.push(event);
    }

    /// Events recorded so far, in emission order.
    pub fn events(&self) -> &[OutputEvent] {
        &self.events
    }

    /// Write the stream as a pretty JSON array. The writer is used once.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(mut output) = self.output.take() {
            let json = serde_json::to_string_pretty(&self.events)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

/// Radio parameters of a transmission as seen in the dispatch log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxRecord {
    pub sender: String,
    pub direction: &'static str,
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    pub tx_power_dbm: f64,
    pub attempt: u8,
    pub mtype: &'static str,
    pub airtime_us: u64,
}

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub time_us: u64,
    pub id: u64,
    pub kind: &'static str,
    pub targets: Vec<u64>,
    /// Set for `TxStart` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmission: Option<TxRecord>,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    scheduler: Scheduler,
    simulation: BuiltSimulation,
    context: SimContext,
    recorder: OutputRecorder,
    stats: SimulationStats,
    entity_names: BTreeMap<EntityId, String>,
    dispatch_log: Option<Vec<DispatchRecord>>,
}

impl EventLoop {
    /// Create an event loop over a built simulation.
    ///
    /// The simulation's seed events are re-numbered from the context's id
    /// sequence so every event id in the run is unique.
    pub fn new(mut simulation: BuiltSimulation, seed: u64, output: Option<Box<dyn Write>>) -> Self {
        let mut context = SimContext::new(seed);
        let mut scheduler = Scheduler::new();
        for mut event in std::mem::take(&mut simulation.initial_events) {
            event.id = EventId(context.next_event_id());
            scheduler.schedule(event);
        }

        let mut stats = SimulationStats::default();
        let mut entity_names = BTreeMap::new();
        for node in &simulation.nodes {
            entity_names.insert(node.entity_id, node.name.clone());
            if node.kind == NodeKind::Device {
                stats.devices.insert(node.name.clone(), DeviceStats::default());
            }
        }
        info!(
            "Runner: {} entities, {} seed events, seed {}",
            simulation.entities.len(),
            scheduler.len(),
            seed
        );

        EventLoop {
            scheduler,
            simulation,
            context,
            recorder: OutputRecorder::new(output),
            stats,
            entity_names,
            dispatch_log: None,
        }
    }

    /// Keep a record of every dispatched event.
    pub fn with_dispatch_log(mut self) -> Self {
        self.dispatch_log = Some(Vec::new());
        self
    }

    /// Run for a fixed simulated duration.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_until(EndCondition::Duration(duration))
    }

    /// Run until the end condition holds.
    pub fn run_until(&mut self, end: EndCondition) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(end, None, |_, _, _| {})
    }

    /// Run with an optional stop flag and a progress callback.
    ///
    /// The callback gets the loop, the progress and whether this is the
    /// final report. It fires every 5 s of wall time or 100k events.
    pub fn run_with_progress<F>(
        &mut self,
        end: EndCondition,
        stop_flag: Option<Arc<AtomicBool>>,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Self, ProgressInfo, bool),
    {
        let start_time = Instant::now();
        let progress_interval = Duration::from_secs(5);
        let event_progress_interval = 100_000u64;
        let mut last_progress = Instant::now();
        let mut last_progress_sim_time = self.context.time();
        let mut last_progress_events = self.stats.total_events;

        let mut target_time = None;
        match end {
            EndCondition::Duration(t) => {
                self.schedule_end(t);
                target_time = Some(t);
            }
            EndCondition::PacketCount(n) if self.stats.data_uplinks >= n => {
                let now = self.context.time();
                self.schedule_end(now);
                target_time = Some(now);
            }
            _ => {}
        }

        loop {
            if let Some(ref flag) = stop_flag {
                if flag.load(Ordering::Relaxed) {
                    debug!("Runner: stop requested at {}", self.context.time());
                    break;
                }
            }
            let Some(event) = self.scheduler.pop() else {
                break;
            };

            let now = self.context.time();
            if event.time < now {
                return Err(SimError::TimeReversal {
                    event_us: event.time.as_micros(),
                    clock_us: now.as_micros(),
                }
                .into());
            }
            self.context.set_time(event.time);

            if matches!(event.payload, EventPayload::SimulationEnd) {
                break;
            }

            self.log_dispatch(&event);
            self.simulation.entities.dispatch_event(&event, &mut self.context)?;

            for new_event in self.context.take_pending_events() {
                self.scheduler.schedule(new_event);
            }
            for (id, requester) in self.context.take_cancellations() {
                if let Err(e) = self.scheduler.cancel(id, requester) {
                    debug!("Runner: ignoring cancellation: {}", e);
                }
            }
            for out in self.context.take_outputs() {
                self.stats.record_output(&out);
                self.recorder.record(out);
            }

            self.stats.total_events += 1;
            self.count_event(&event);

            if let (EndCondition::PacketCount(n), EventPayload::TxStart(tx)) = (end, &event.payload) {
                if target_time.is_none() && self.stats.data_uplinks >= n {
                    let at = tx.end + self.simulation.settle_time();
                    info!("Runner: packet limit {} reached, ending at {}", n, at);
                    self.schedule_end(at);
                    target_time = Some(at);
                }
            }

            let events_since_last = self.stats.total_events - last_progress_events;
            if last_progress.elapsed() >= progress_interval || events_since_last >= event_progress_interval {
                let sim_time = self.context.time();
                let sim_delta = sim_time.as_secs_f64() - last_progress_sim_time.as_secs_f64();
                let wall_delta = last_progress.elapsed().as_secs_f64();
                let progress = ProgressInfo {
                    sim_time,
                    target_time,
                    wall_elapsed: start_time.elapsed(),
                    events_processed: self.stats.total_events,
                    time_multiplier: if wall_delta > 0.0 { sim_delta / wall_delta } else { 0.0 },
                    progress_percent: percent(sim_time, target_time),
                };
                on_progress(self, progress, false);
                last_progress = Instant::now();
                last_progress_sim_time = sim_time;
                last_progress_events = self.stats.total_events;
            }
        }

        // a stopped run may leave its sentinel behind
        let _ = self.scheduler.cancel(END_EVENT_ID, END_EVENT_OWNER);

        self.stats.simulation_time_us = self.context.time().as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        self.stats.finalize();

        let wall_elapsed = start_time.elapsed();
        let sim_time = self.context.time();
        let wall_secs = wall_elapsed.as_secs_f64();
        let progress = ProgressInfo {
            sim_time,
            target_time,
            wall_elapsed,
            events_processed: self.stats.total_events,
            time_multiplier: if wall_secs > 0.0 { sim_time.as_secs_f64() / wall_secs } else { 0.0 },
            progress_percent: Some(100.0),
        };
        on_progress(self, progress, true);

        info!(
            "Runner: finished at {} after {} events, {} of {} data uplinks delivered",
            sim_time, self.stats.total_events, self.stats.delivered, self.stats.data_uplinks
        );
        self.recorder.flush()?;
        Ok(self.stats.clone())
    }

    fn schedule_end(&mut self, at: SimTime) {
        self.scheduler.schedule(Event {
            id: END_EVENT_ID,
            time: at,
            source: END_EVENT_OWNER,
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });
    }

    fn name_of(&self, id: EntityId) -> String {
        self.entity_names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("entity-{}", id.0))
    }

    fn count_event(&mut self, event: &Event) {
        let kind = event.payload.kind();
        for target in &event.targets {
            let labels = [("node", self.name_of(*target)), ("kind", kind.to_string())];
            metrics::counter!(metric_defs::SIMULATION_EVENTS.name, &labels).increment(1);
        }

        let EventPayload::TxStart(tx) = &event.payload else {
            return;
        };
        if tx.direction != Direction::Up {
            return;
        }
        let first_data = tx.attempt == 1 && !matches!(tx.frame.mtype(), Some(MType::JoinRequest) | None);
        let name = self.name_of(tx.sender);
        self.stats.uplinks_sent += 1;
        if first_data {
            self.stats.data_uplinks += 1;
        }
        let device = self.stats.devices.entry(name).or_default();
        device.uplinks_sent += 1;
        if first_data {
            device.data_uplinks += 1;
        }
    }

    fn log_dispatch(&mut self, event: &Event) {
        if self.dispatch_log.is_none() {
            return;
        }
        let transmission = match &event.payload {
            EventPayload::TxStart(tx) => Some(self.tx_record(tx)),
            _ => None,
        };
        let record = DispatchRecord {
            time_us: event.time.as_micros(),
            id: event.id.0,
            kind: event.payload.kind(),
            targets: event.targets.iter().map(|t| t.0).collect(),
            transmission,
        };
        if let Some(log) = self.dispatch_log.as_mut() {
            log.push(record);
        }
    }

    fn tx_record(&self, tx: &Transmission) -> TxRecord {
        TxRecord {
            sender: self.name_of(tx.sender),
            direction: match tx.direction {
                Direction::Up => "up",
                Direction::Down => "down",
            },
            frequency_hz: tx.params.frequency_hz,
            spreading_factor: tx.params.spreading_factor,
            tx_power_dbm: tx.params.tx_power_dbm,
            attempt: tx.attempt,
            mtype: tx.frame.mtype_label(),
            airtime_us: tx.airtime().as_micros(),
        }
    }

    /// Output events recorded so far.
    pub fn outputs(&self) -> &[OutputEvent] {
        self.recorder.events()
    }

    /// Dispatch log, if enabled with [`EventLoop::with_dispatch_log`].
    pub fn dispatch_log(&self) -> Option<&[DispatchRecord]> {
        self.dispatch_log.as_deref()
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn simulation(&self) -> &BuiltSimulation {
        &self.simulation
    }

    /// Current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Number of events still scheduled.
    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }
}

fn percent(now: SimTime, target: Option<SimTime>) -> Option<f64> {
    let target = target?;
    if target == SimTime::ZERO {
        return Some(100.0);
    }
    Some((now.as_secs_f64() / target.as_secs_f64() * 100.0).min(100.0))
}

/// Create an event loop without an output writer.
pub fn create_event_loop(simulation: BuiltSimulation, seed: u64) -> EventLoop {
    EventLoop::new(simulation, seed, None)
}

/// Build and run a scenario with its own seed and end condition.
pub fn run_scenario(scenario: &Scenario, output: Option<Box<dyn Write>>) -> Result<SimulationStats, RunnerError> {
    let seed = scenario.simulation.seed;
    let end = EndCondition::from_scenario(scenario)?;
    let simulation = build_simulation(scenario, seed)?;
    EventLoop::new(simulation, seed, output).run_until(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
simulation:
  seed: 11
channel:
  environment:
    path_loss_exponent: 2.0
    shadowing_std_db: 0.0
    reference_loss_db: 80.0
    reference_distance_m: 1.0
  channels: [868100000]
gateways:
  - name: gw-0
    position: { x: 0, y: 0 }
devices:
  - name: node
    count: 2
    position: { x: 30, y: 40 }
    activation:
      mode: abp
      dev_addr: "26011B00"
      nwk_skey: "2B7E151628AED2A6ABF7158809CF4F3C"
      app_skey: "3C4FCF098815F7ABA6D2AE2816157E2B"
    settings:
      spreading_factor: 7
      traffic:
        interval_s: 60
"#;

    fn event_loop() -> EventLoop {
        let scenario = load_scenario_from_str(SCENARIO).unwrap();
        EventLoop::new(build_simulation(&scenario, 11).unwrap(), 11, None).with_dispatch_log()
    }

    #[test]
    fn test_end_condition_from_scenario() {
        let mut scenario = load_scenario_from_str(SCENARIO).unwrap();
        assert_eq!(EndCondition::from_scenario(&scenario).unwrap(), EndCondition::QueueExhausted);
        scenario.simulation.duration_s = Some(2.5);
        assert_eq!(
            EndCondition::from_scenario(&scenario).unwrap(),
            EndCondition::Duration(SimTime::from_millis(2500))
        );
        scenario.simulation.packet_limit = Some(7);
        assert_eq!(EndCondition::from_scenario(&scenario).unwrap(), EndCondition::PacketCount(7));
        scenario.simulation.packet_limit = None;
        scenario.simulation.duration_s = Some(-1.0);
        assert!(matches!(
            EndCondition::from_scenario(&scenario),
            Err(RunnerError::Simulation(SimError::NegativeTime(_)))
        ));
    }

    #[test]
    fn test_duration_stops_clock() {
        let mut ev = event_loop();
        let stats = ev.run(SimTime::from_secs(600.0)).unwrap();
        assert_eq!(stats.simulation_time_us, 600_000_000);
        assert!(ev
            .dispatch_log()
            .unwrap()
            .iter()
            .all(|r| r.time_us <= 600_000_000));
        // ten periods for each of the two devices, give or take the first offset
        assert!((18..=20).contains(&stats.data_uplinks), "{}", stats.data_uplinks);
        assert_eq!(stats.devices.len(), 2);
        assert!(ev.pending_events() > 0);
    }

    #[test]
    fn test_packet_count_settles_last_uplink() {
        let mut ev = event_loop();
        let stats = ev.run_until(EndCondition::PacketCount(5)).unwrap();
        assert!(stats.data_uplinks >= 5);
        let log = ev.dispatch_log().unwrap();
        let fifth = log
            .iter()
            .filter(|r| {
                r.transmission
                    .as_ref()
                    .map(|t| t.direction == "up" && t.attempt == 1)
                    .unwrap_or(false)
            })
            .nth(4)
            .unwrap();
        let airtime = fifth.transmission.as_ref().unwrap().airtime_us;
        let settle = ev.simulation().settle_time().as_micros();
        assert_eq!(stats.simulation_time_us, fifth.time_us + airtime + settle);
        // the first five uplinks were all decided
        assert!(stats.delivered + stats.collided + stats.lost >= 5);
    }

    #[test]
    fn test_run_continues_where_it_stopped() {
        let mut ev = event_loop();
        ev.run(SimTime::from_secs(120.0)).unwrap();
        let first = ev.stats().data_uplinks;
        let stats = ev.run(SimTime::from_secs(240.0)).unwrap();
        assert!(stats.data_uplinks > first);
        assert_eq!(stats.simulation_time_us, 240_000_000);
    }

    #[test]
    fn test_stop_flag_and_progress() {
        let mut ev = event_loop();
        let flag = Arc::new(AtomicBool::new(true));
        let mut finals = 0;
        let stats = ev
            .run_with_progress(EndCondition::QueueExhausted, Some(flag), |_, p, is_final| {
                if is_final {
                    finals += 1;
                    assert_eq!(p.progress_percent, Some(100.0));
                }
            })
            .unwrap();
        assert_eq!(finals, 1);
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn test_output_recorder_writes_json_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let writer = file.reopen().unwrap();
        let mut recorder = OutputRecorder::new(Some(Box::new(writer)));
        recorder.record(OutputEvent::new(SimTime::from_secs(1.0), OutputKind::Delivered).device("a"));
        recorder.flush().unwrap();
        recorder.flush().unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let parsed: Vec<OutputEvent> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].device.as_deref(), Some("a"));
    }

    #[test]
    fn test_stats_count_outputs() {
        let mut stats = SimulationStats::default();
        stats.data_uplinks = 4;
        for kind in [OutputKind::Delivered, OutputKind::Delivered, OutputKind::Collided, OutputKind::JoinRejected] {
            stats.record_output(&OutputEvent::new(SimTime::ZERO, kind).device("dev"));
        }
        stats.finalize();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.devices["dev"].collided, 1);
        assert_eq!(stats.join_rejected, 1);
        assert!((stats.delivery_ratio - 0.5).abs() < 1e-12);
    }
}
