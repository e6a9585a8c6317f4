//! Network server entity.
//!
//! Receives uplink copies from gateways, deduplicates them inside an
//! aggregation window, enforces frame security, runs ADR and schedules
//! downlinks into the receive opportunities of each device class.
//!
//! ADR runs when an uplink's aggregation window closes. With the default
//! 1.2 s window that is after the uplink's RX2, so a resulting LinkADRReq is
//! queued and rides the RX1 of the device's next uplink.

use crate::adr::{self, AdrConfig, SnrHistory};
use crate::device::Activation;
use crate::downlink::{DownlinkItem, DownlinkQueue};
use crate::join::JoinServer;
use crate::{ChannelPlan, DeviceClass, MacTiming};
use lorasim_common::metric_defs;
use lorasim_common::{
    DedupKey, Direction, Entity, EntityId, Event, EventPayload, LoraFrame, OutputEvent, OutputKind, RadioParams,
    Reception, RxWindowKind, SimContext, SimError, SimTime, Transmission, UplinkForward,
};
use lorasim_phy::{time_on_air, LoraPhyConfig};
use lorawan_packet::mac::encoded_len;
use lorawan_packet::region::{sf_to_dr, tx_power_dbm, tx_power_index};
use lorawan_packet::{
    extend_fcnt, DataFrame, DevAddr, Eui64, FCtrl, FrameParams, JoinRequest, MacCommand, PhyPayload,
    SecurityError, SessionKeys, MAX_FOPTS,
};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};

/// Port used for simulated application downlinks.
const APP_DOWNLINK_PORT: u8 = 1;

// ============================================================================
// Configuration
// ============================================================================

/// What the server knows about one device before the run.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub name: String,
    pub entity: EntityId,
    pub class: DeviceClass,
    pub ping_periodicity: u8,
    pub activation: Activation,
    /// Queue an application downlink at this period.
    pub downlink_interval: Option<SimTime>,
    pub downlink_payload_bytes: usize,
}

/// Network server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub net_id: u32,
    pub adr: AdrConfig,
    /// Network-side ADR switch; devices still set their own ADR bit.
    pub adr_enabled: bool,
    pub aggregation_window: SimTime,
    pub timing: MacTiming,
    pub plan: ChannelPlan,
    pub phy: LoraPhyConfig,
    pub devices: Vec<DeviceRegistration>,
    /// Gateway entities and their names.
    pub gateways: BTreeMap<EntityId, String>,
}

// ============================================================================
// Per-device State
// ============================================================================

/// Timing and reach of the most recent uplink, for class A replies.
#[derive(Debug, Clone)]
struct LastUplink {
    end: SimTime,
    frequency_hz: u32,
    spreading_factor: u8,
    /// Gateways that heard it, best SNR first.
    gateways: Vec<(f64, EntityId)>,
    /// A downlink already went into this uplink's windows.
    consumed: bool,
}

impl LastUplink {
    fn add_gateway(&mut self, snr_db: f64, gateway: EntityId) {
        if self.gateways.iter().any(|(_, g)| *g == gateway) {
            return;
        }
        self.gateways.push((snr_db, gateway));
        self.gateways.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    }
}

#[derive(Debug, Clone)]
struct LinkState {
    snr_history: SnrHistory,
    spreading_factor: u8,
    tx_power_index: u8,
    adr: bool,
    last_fcnt_up: Option<u32>,
    fcnt_down: u32,
    last_uplink: Option<LastUplink>,
    /// Uplinks seen since the last LinkADRReq went unanswered.
    adr_outstanding: Option<usize>,
    ack_pending: bool,
    reply_required: bool,
}

impl LinkState {
    fn new() -> Self {
        LinkState {
            snr_history: SnrHistory::default(),
            spreading_factor: 12,
            tx_power_index: 0,
            adr: false,
            last_fcnt_up: None,
            fcnt_down: 0,
            last_uplink: None,
            adr_outstanding: None,
            ack_pending: false,
            reply_required: false,
        }
    }

    fn wants_downlink(&self) -> bool {
        self.ack_pending || self.reply_required
    }
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    reg: DeviceRegistration,
    dev_addr: Option<DevAddr>,
    keys: Option<SessionKeys>,
    link: LinkState,
    queue: DownlinkQueue,
}

/// Copies of one uplink collected inside the aggregation window.
#[derive(Debug, Clone)]
struct Aggregation {
    device: Option<usize>,
    accepted: bool,
    is_join: bool,
    fcnt: u32,
    adr_bit: bool,
    best: Reception,
    best_gateway: EntityId,
    gateways: BTreeSet<EntityId>,
}

/// A chosen downlink slot.
#[derive(Debug, Clone, Copy)]
struct Slot {
    at: SimTime,
    frequency_hz: u32,
    spreading_factor: u8,
    gateway: EntityId,
    window: RxWindowKind,
    from_last_uplink: bool,
}

/// The LoRaWAN network server.
pub struct NetworkServer {
    id: EntityId,
    config: ServerConfig,
    devices: Vec<DeviceRecord>,
    by_addr: BTreeMap<DevAddr, usize>,
    by_eui: BTreeMap<Eui64, usize>,
    join_server: JoinServer,
    aggregations: BTreeMap<DedupKey, Aggregation>,
    closed_joins: BTreeSet<DedupKey>,
    gateway_busy_until: BTreeMap<EntityId, SimTime>,
}

impl NetworkServer {
    pub fn new(id: EntityId, config: ServerConfig) -> Self {
        let mut join_server = JoinServer::new(config.net_id);
        let mut devices = Vec::with_capacity(config.devices.len());
        let mut by_addr = BTreeMap::new();
        let mut by_eui = BTreeMap::new();

        for (idx, reg) in config.devices.iter().enumerate() {
            let (dev_addr, keys) = match &reg.activation {
                Activation::Abp { dev_addr, keys } => {
                    join_server.reserve(*dev_addr);
                    by_addr.insert(*dev_addr, idx);
                    (Some(*dev_addr), Some(*keys))
                }
                Activation::Otaa {
                    dev_eui,
                    join_eui,
                    app_key,
                } => {
                    join_server.register(*join_eui, *dev_eui, *app_key);
                    by_eui.insert(*dev_eui, idx);
                    (None, None)
                }
            };
            devices.push(DeviceRecord {
                reg: reg.clone(),
                dev_addr,
                keys,
                link: LinkState::new(),
                queue: DownlinkQueue::new(),
            });
        }

        let gateway_busy_until = config.gateways.keys().map(|g| (*g, SimTime::ZERO)).collect();
        NetworkServer {
            id,
            config,
            devices,
            by_addr,
            by_eui,
            join_server,
            aggregations: BTreeMap::new(),
            closed_joins: BTreeSet::new(),
            gateway_busy_until,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Application downlink timers, one per device that has a downlink interval.
    pub fn initial_events(&self) -> Vec<(SimTime, EventPayload)> {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(idx, d)| {
                d.reg
                    .downlink_interval
                    .map(|interval| (interval, EventPayload::Timer { timer_id: idx as u64 }))
            })
            .collect()
    }

    fn gateway_name(&self, gateway: EntityId) -> String {
        self.config
            .gateways
            .get(&gateway)
            .cloned()
            .unwrap_or_else(|| format!("gw-{}", gateway.0))
    }

    fn labels(&self) -> [(&'static str, String); 1] {
        metric_defs::node_labels(&self.config.name)
    }

    fn reject(
        &self,
        ctx: &mut SimContext,
        reason: &'static str,
        device: Option<usize>,
        forward: &UplinkForward,
        fcnt: Option<u32>,
        detail: String,
    ) {
        debug!("NetworkServer[{}]: rejected uplink ({}): {}", self.config.name, reason, detail);
        let mut labels = self.labels().to_vec();
        labels.push(("reason", reason.to_string()));
        metrics::counter!(metric_defs::SERVER_SECURITY_REJECTED.name, &labels).increment(1);
        let mut out = OutputEvent::new(ctx.time(), OutputKind::SecurityRejected)
            .gateway(self.gateway_name(forward.gateway))
            .sf(forward.reception.transmission.params.spreading_factor)
            .signal(forward.reception.rssi_dbm, forward.reception.snr_db)
            .detail(format!("{}: {}", reason, detail));
        if let Some(idx) = device {
            out = out.device(self.devices[idx].reg.name.clone());
        }
        if let Some(fcnt) = fcnt {
            out = out.fcnt(fcnt);
        }
        ctx.emit(out);
    }

    fn open_aggregation(&mut self, key: DedupKey, aggregation: Aggregation, ctx: &mut SimContext) {
        self.aggregations.insert(key, aggregation);
        ctx.post_event(
            self.config.aggregation_window,
            vec![self.id],
            EventPayload::AggregationClose(key),
        );
    }

    /// Fold a further copy into an open aggregation.
    fn merge_copy(&mut self, key: &DedupKey, forward: &UplinkForward) -> bool {
        let Some(agg) = self.aggregations.get_mut(key) else {
            return false;
        };
        agg.gateways.insert(forward.gateway);
        if forward.reception.snr_db > agg.best.snr_db {
            agg.best = forward.reception.clone();
            agg.best_gateway = forward.gateway;
        }
        if let Some(idx) = agg.device.filter(|_| agg.accepted) {
            if let Some(last) = self.devices[idx].link.last_uplink.as_mut() {
                if last.end == forward.reception.transmission.end {
                    last.add_gateway(forward.reception.snr_db, forward.gateway);
                }
            }
        }
        metrics::counter!(metric_defs::SERVER_DUPLICATES.name, &self.labels()).increment(1);
        true
    }

    // ========================================================================
    // Uplinks
    // ========================================================================

    fn handle_uplink(&mut self, forward: &UplinkForward, ctx: &mut SimContext) -> Result<(), SimError> {
        let payload = match PhyPayload::decode(&forward.reception.transmission.frame.bytes) {
            Ok(p) => p,
            Err(e) => {
                self.reject(ctx, "malformed", None, forward, None, e.to_string());
                return Ok(());
            }
        };
        match payload {
            PhyPayload::JoinRequest(request) => self.handle_join_request(&request, forward, ctx),
            PhyPayload::Data(frame) if frame.direction() == Direction::Up => {
                self.handle_data_uplink(&frame, forward, ctx)
            }
            _ => {
                trace!("NetworkServer[{}]: ignoring non-uplink frame", self.config.name);
                Ok(())
            }
        }
    }

    fn handle_join_request(
        &mut self,
        request: &JoinRequest,
        forward: &UplinkForward,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        let key = DedupKey::Join {
            dev_eui: request.dev_eui,
            dev_nonce: request.dev_nonce,
        };
        if self.merge_copy(&key, forward) {
            return Ok(());
        }
        if self.closed_joins.contains(&key) {
            trace!(
                "NetworkServer[{}]: late copy of join {} nonce {}",
                self.config.name,
                request.dev_eui,
                request.dev_nonce
            );
            metrics::counter!(metric_defs::SERVER_DUPLICATES.name, &self.labels()).increment(1);
            return Ok(());
        }

        let device = self.by_eui.get(&request.dev_eui).copied();
        let accepted = match self.join_server.handle_join(request) {
            Ok(outcome) => {
                let Some(idx) = device else {
                    return Err(SimError::HandlerError {
                        entity: self.id,
                        message: format!("join server knows DevEUI {} but no device does", request.dev_eui),
                    });
                };
                let tx = &forward.reception.transmission;
                let record = &mut self.devices[idx];
                if let Some(old) = record.dev_addr.replace(outcome.dev_addr) {
                    self.by_addr.remove(&old);
                }
                self.by_addr.insert(outcome.dev_addr, idx);
                record.keys = Some(outcome.keys);
                record.link = LinkState::new();
                record.link.spreading_factor = tx.params.spreading_factor;
                record.link.tx_power_index = tx_power_index(tx.params.tx_power_dbm);
                record.link.last_uplink = Some(LastUplink {
                    end: tx.end,
                    frequency_hz: tx.params.frequency_hz,
                    spreading_factor: tx.params.spreading_factor,
                    gateways: vec![(forward.reception.snr_db, forward.gateway)],
                    consumed: false,
                });
                record.queue = DownlinkQueue::new();
                record.queue.push(DownlinkItem::JoinAccept(outcome.accept));
                info!(
                    "NetworkServer[{}]: {} joined as {}",
                    self.config.name, record.reg.name, outcome.dev_addr
                );
                metrics::counter!(metric_defs::SERVER_JOINS.name, &self.labels()).increment(1);
                ctx.post_immediate(
                    vec![self.id],
                    EventPayload::DownlinkOpportunity {
                        dev_addr: outcome.dev_addr,
                    },
                );
                true
            }
            Err(e) => {
                let reason = rejection_reason(&e);
                debug!("NetworkServer[{}]: join rejected: {}", self.config.name, e);
                let mut labels = self.labels().to_vec();
                labels.push(("reason", reason.to_string()));
                metrics::counter!(metric_defs::SERVER_SECURITY_REJECTED.name, &labels).increment(1);
                let mut out = OutputEvent::new(ctx.time(), OutputKind::JoinRejected)
                    .gateway(self.gateway_name(forward.gateway))
                    .sf(forward.reception.transmission.params.spreading_factor)
                    .signal(forward.reception.rssi_dbm, forward.reception.snr_db)
                    .detail(format!("{}: {}", reason, e));
                if let Some(idx) = device {
                    out = out.device(self.devices[idx].reg.name.clone());
                }
                ctx.emit(out);
                false
            }
        };

        self.open_aggregation(
            key,
            Aggregation {
                device,
                accepted,
                is_join: true,
                fcnt: 0,
                adr_bit: false,
                best: forward.reception.clone(),
                best_gateway: forward.gateway,
                gateways: BTreeSet::from([forward.gateway]),
            },
            ctx,
        );
        Ok(())
    }

    fn handle_data_uplink(
        &mut self,
        frame: &DataFrame,
        forward: &UplinkForward,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        let key = DedupKey::Data {
            dev_addr: frame.dev_addr,
            fcnt: frame.fcnt,
        };
        if self.merge_copy(&key, forward) {
            return Ok(());
        }
        let rejected = |device: Option<usize>| Aggregation {
            device,
            accepted: false,
            is_join: false,
            fcnt: frame.fcnt as u32,
            adr_bit: false,
            best: forward.reception.clone(),
            best_gateway: forward.gateway,
            gateways: BTreeSet::from([forward.gateway]),
        };

        let Some(idx) = self.by_addr.get(&frame.dev_addr).copied() else {
            self.reject(
                ctx,
                "unknown_device",
                None,
                forward,
                Some(frame.fcnt as u32),
                format!("DevAddr {}", frame.dev_addr),
            );
            self.open_aggregation(key, rejected(None), ctx);
            return Ok(());
        };
        let Some(keys) = self.devices[idx].keys else {
            self.reject(ctx, "unknown_device", Some(idx), forward, None, "no session".to_string());
            self.open_aggregation(key, rejected(Some(idx)), ctx);
            return Ok(());
        };

        let last = self.devices[idx].link.last_fcnt_up;
        let fcnt = match last {
            Some(last) => {
                // A lower wire counter is either a replay or a 16-bit rollover.
                let same_epoch = (last & 0xFFFF_0000) | frame.fcnt as u32;
                if same_epoch < last && frame.verify_mic(&keys.nwk_skey, same_epoch).is_ok() {
                    same_epoch
                } else {
                    extend_fcnt(last, frame.fcnt)
                }
            }
            None => frame.fcnt as u32,
        };
        if let Err(e) = frame.verify_mic(&keys.nwk_skey, fcnt) {
            self.reject(ctx, rejection_reason(&e), Some(idx), forward, Some(fcnt), e.to_string());
            self.open_aggregation(key, rejected(Some(idx)), ctx);
            return Ok(());
        }
        let confirmed = frame.mtype.is_confirmed();
        let tx = &forward.reception.transmission;

        if let Some(last) = last {
            if fcnt == last {
                // Same counter again: a retransmission after its window closed.
                debug!(
                    "NetworkServer[{}]: {} repeated fcnt {}",
                    self.config.name, self.devices[idx].reg.name, fcnt
                );
                metrics::counter!(metric_defs::SERVER_DUPLICATES.name, &self.labels()).increment(1);
                let link = &mut self.devices[idx].link;
                link.last_uplink = Some(LastUplink {
                    end: tx.end,
                    frequency_hz: tx.params.frequency_hz,
                    spreading_factor: tx.params.spreading_factor,
                    gateways: vec![(forward.reception.snr_db, forward.gateway)],
                    consumed: false,
                });
                if confirmed {
                    link.ack_pending = true;
                    ctx.post_immediate(
                        vec![self.id],
                        EventPayload::DownlinkOpportunity {
                            dev_addr: frame.dev_addr,
                        },
                    );
                }
                self.open_aggregation(key, rejected(Some(idx)), ctx);
                return Ok(());
            }
            if fcnt < last {
                let e = SecurityError::StaleFrameCounter {
                    dev_addr: frame.dev_addr.to_string(),
                    received: fcnt,
                    last,
                };
                self.reject(ctx, rejection_reason(&e), Some(idx), forward, Some(fcnt), e.to_string());
                self.open_aggregation(key, rejected(Some(idx)), ctx);
                return Ok(());
            }
        }

        let history_len = self.config.adr.history_len;
        let link = &mut self.devices[idx].link;
        link.last_fcnt_up = Some(fcnt);
        link.spreading_factor = tx.params.spreading_factor;
        link.tx_power_index = tx_power_index(tx.params.tx_power_dbm);
        link.adr = frame.fctrl.adr;
        link.ack_pending = confirmed;
        if frame.fctrl.adr_ack_req {
            link.reply_required = true;
        }
        if let Some(n) = link.adr_outstanding.as_mut() {
            *n += 1;
            if *n >= history_len {
                link.adr_outstanding = None;
            }
        }
        link.last_uplink = Some(LastUplink {
            end: tx.end,
            frequency_hz: tx.params.frequency_hz,
            spreading_factor: tx.params.spreading_factor,
            gateways: vec![(forward.reception.snr_db, forward.gateway)],
            consumed: false,
        });

        let commands = frame.mac_commands(&keys, fcnt).unwrap_or_else(|e| {
            debug!("NetworkServer[{}]: bad MAC commands: {}", self.config.name, e);
            Vec::new()
        });
        for cmd in &commands {
            self.answer_command(idx, cmd, forward, ctx);
        }
        trace!(
            "NetworkServer[{}]: {} fcnt {} via {} ({} MAC commands)",
            self.config.name,
            self.devices[idx].reg.name,
            fcnt,
            self.gateway_name(forward.gateway),
            commands.len()
        );

        self.open_aggregation(
            key,
            Aggregation {
                device: Some(idx),
                accepted: true,
                is_join: false,
                fcnt,
                adr_bit: frame.fctrl.adr,
                best: forward.reception.clone(),
                best_gateway: forward.gateway,
                gateways: BTreeSet::from([forward.gateway]),
            },
            ctx,
        );
        ctx.post_immediate(
            vec![self.id],
            EventPayload::DownlinkOpportunity {
                dev_addr: frame.dev_addr,
            },
        );
        Ok(())
    }

    fn answer_command(&mut self, idx: usize, cmd: &MacCommand, forward: &UplinkForward, ctx: &mut SimContext) {
        let now = ctx.time();
        let name = self.config.name.clone();
        let required = self
            .config
            .phy
            .snr_threshold(forward.reception.transmission.params.spreading_factor)
            .unwrap_or(0.0);
        let copies = self
            .devices[idx]
            .link
            .last_uplink
            .as_ref()
            .map(|l| l.gateways.len())
            .unwrap_or(0)
            .max(1);
        let record = &mut self.devices[idx];
        match cmd {
            MacCommand::LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                debug!(
                    "NetworkServer[{}]: {} LinkADRAns power {} dr {} mask {}",
                    name, record.reg.name, power_ack, data_rate_ack, channel_mask_ack
                );
                record.link.adr_outstanding = None;
            }
            MacCommand::LinkCheckReq => {
                let margin = (forward.reception.snr_db - required).round().clamp(0.0, 254.0) as u8;
                record.queue.push(DownlinkItem::MacCommand(MacCommand::LinkCheckAns {
                    margin,
                    gateway_count: copies.min(255) as u8,
                }));
            }
            MacCommand::DeviceTimeReq => {
                let secs = now.as_secs_f64();
                record.queue.push(DownlinkItem::MacCommand(MacCommand::DeviceTimeAns {
                    seconds: secs.trunc() as u32,
                    fraction: (secs.fract() * 256.0) as u8,
                }));
            }
            MacCommand::PingSlotInfoReq { periodicity } => {
                record.reg.ping_periodicity = (*periodicity).min(7);
                record.queue.push(DownlinkItem::MacCommand(MacCommand::PingSlotInfoAns));
            }
            MacCommand::DevStatusAns { battery, margin } => {
                debug!(
                    "NetworkServer[{}]: {} battery {} margin {} dB",
                    name, record.reg.name, battery, margin
                );
            }
            other => {
                trace!("NetworkServer[{}]: {} sent {}", name, record.reg.name, other.as_label());
            }
        }
    }

    fn handle_aggregation_close(&mut self, key: &DedupKey, ctx: &mut SimContext) {
        let Some(agg) = self.aggregations.remove(key) else {
            return;
        };
        if !agg.accepted {
            return;
        }
        if agg.is_join {
            self.closed_joins.insert(*key);
            return;
        }
        let Some(idx) = agg.device else {
            return;
        };
        let count = agg.gateways.len();
        let tx = &agg.best.transmission;
        let labels = self.labels();
        metrics::counter!(metric_defs::SERVER_DELIVERED.name, &labels).increment(1);
        metrics::histogram!(metric_defs::SERVER_GATEWAY_COUNT.name, &labels).record(count as f64);
        ctx.emit(
            OutputEvent::new(ctx.time(), OutputKind::Delivered)
                .device(self.devices[idx].reg.name.clone())
                .gateway(self.gateway_name(agg.best_gateway))
                .fcnt(agg.fcnt)
                .sf(tx.params.spreading_factor)
                .signal(agg.best.rssi_dbm, agg.best.snr_db)
                .tx_power(tx.params.tx_power_dbm)
                .airtime(tx.airtime())
                .detail(format!("{} gateways", count)),
        );

        let history_len = self.config.adr.history_len;
        let record = &mut self.devices[idx];
        record.link.snr_history.push(agg.best.snr_db, history_len);
        if agg.adr_bit && self.config.adr_enabled {
            if let Some(dev_addr) = record.dev_addr {
                ctx.post_immediate(vec![self.id], EventPayload::AdrEvaluate { dev_addr });
            }
        }
    }

    fn handle_adr_evaluate(&mut self, dev_addr: DevAddr, ctx: &mut SimContext) {
        let Some(idx) = self.by_addr.get(&dev_addr).copied() else {
            return;
        };
        let channel_count = self.config.plan.uplink_channels.len().min(16);
        let record = &mut self.devices[idx];
        if record.link.adr_outstanding.is_some() || record.queue.has_link_adr_req() {
            return;
        }
        let link = &record.link;
        let Some(decision) = adr::evaluate(
            &self.config.adr,
            &link.snr_history,
            link.spreading_factor,
            link.tx_power_index,
        ) else {
            return;
        };
        let Some(data_rate) = sf_to_dr(decision.spreading_factor) else {
            return;
        };
        let ch_mask = ((1u32 << channel_count) - 1) as u16;
        debug!(
            "NetworkServer[{}]: ADR {} SF{} power {} -> SF{} power {}",
            self.config.name,
            record.reg.name,
            link.spreading_factor,
            link.tx_power_index,
            decision.spreading_factor,
            decision.tx_power_index
        );
        record.queue.push(DownlinkItem::MacCommand(MacCommand::link_adr_req(
            data_rate,
            decision.tx_power_index,
            ch_mask,
            0,
        )));
        record.link.adr_outstanding = Some(0);
        record.link.snr_history.clear();
        metrics::counter!(metric_defs::SERVER_ADR_COMMANDS.name, &metric_defs::node_labels(&self.config.name))
            .increment(1);
        ctx.post_immediate(vec![self.id], EventPayload::DownlinkOpportunity { dev_addr });
    }

    // ========================================================================
    // Downlinks
    // ========================================================================

    /// Whether a gateway has no downlink on air at `at`.
    fn gateway_free(&self, gateway: EntityId, at: SimTime) -> bool {
        self.gateway_busy_until.get(&gateway).map(|b| *b <= at).unwrap_or(true)
    }

    fn pick_slot(&self, idx: usize, now: SimTime) -> Option<Slot> {
        let record = &self.devices[idx];
        let plan = &self.config.plan;
        let rx = self.config.timing.rx;

        if let Some(last) = record.link.last_uplink.as_ref().filter(|l| !l.consumed) {
            let windows = [
                (
                    RxWindowKind::Rx1,
                    last.end + rx.rx1_delay,
                    plan.rx1_frequency(last.frequency_hz),
                    last.spreading_factor,
                ),
                (
                    RxWindowKind::Rx2,
                    last.end + rx.rx2_delay,
                    plan.rx2_frequency_hz,
                    plan.rx2_spreading_factor,
                ),
            ];
            for (window, open, frequency_hz, spreading_factor) in windows {
                let at = open.max(now);
                if at > open + rx.rx_window {
                    continue;
                }
                if let Some((_, gateway)) = last.gateways.iter().find(|(_, g)| self.gateway_free(*g, at)) {
                    return Some(Slot {
                        at,
                        frequency_hz,
                        spreading_factor,
                        gateway: *gateway,
                        window,
                        from_last_uplink: true,
                    });
                }
            }
        }

        let candidates: Vec<EntityId> = match record.link.last_uplink.as_ref() {
            Some(last) if !last.gateways.is_empty() => last.gateways.iter().map(|(_, g)| *g).collect(),
            _ => self.config.gateways.keys().copied().collect(),
        };
        match record.reg.class {
            DeviceClass::A => None,
            DeviceClass::B => {
                let timing = self.config.timing.class_b;
                let mut after = now;
                // A few periods ahead is plenty for a busy gateway to clear.
                for _ in 0..4 {
                    let at = timing.next_ping_slot(after, record.reg.ping_periodicity)?;
                    if let Some(gateway) = candidates.iter().find(|g| self.gateway_free(**g, at)) {
                        return Some(Slot {
                            at,
                            frequency_hz: plan.ping_slot_frequency(),
                            spreading_factor: plan.rx2_spreading_factor,
                            gateway: *gateway,
                            window: RxWindowKind::PingSlot,
                            from_last_uplink: false,
                        });
                    }
                    after = at + SimTime::from_micros(1);
                }
                None
            }
            DeviceClass::C => {
                let (at, gateway) = candidates
                    .iter()
                    .map(|g| (self.gateway_busy_until.get(g).copied().unwrap_or(SimTime::ZERO).max(now), *g))
                    .min()?;
                Some(Slot {
                    at,
                    frequency_hz: plan.rx2_frequency_hz,
                    spreading_factor: plan.rx2_spreading_factor,
                    gateway,
                    window: RxWindowKind::Rx2,
                    from_last_uplink: false,
                })
            }
        }
    }

    /// Build the next downlink frame for a device from its queue.
    fn build_downlink(&mut self, idx: usize, ctx: &mut SimContext) -> Result<Option<(Vec<u8>, bool)>, SimError> {
        let record = &mut self.devices[idx];
        if matches!(record.queue.peek(), Some(DownlinkItem::JoinAccept(_))) {
            if let Some(DownlinkItem::JoinAccept(bytes)) = record.queue.pop() {
                return Ok(Some((bytes, false)));
            }
        }
        let (Some(dev_addr), Some(keys)) = (record.dev_addr, record.keys) else {
            return Ok(None);
        };

        let mut commands = record.queue.drain_mac_commands();
        let app = if matches!(record.queue.peek(), Some(DownlinkItem::Application { .. })) {
            record.queue.pop()
        } else {
            None
        };
        let (port, payload) = match app {
            Some(DownlinkItem::Application { port, payload }) => (port, payload),
            _ => (APP_DOWNLINK_PORT, Vec::new()),
        };
        let limit = if payload.is_empty() { usize::MAX } else { MAX_FOPTS };
        let mut overflow = Vec::new();
        while encoded_len(&commands) > limit {
            if let Some(cmd) = commands.pop() {
                overflow.push(cmd);
            }
        }
        for cmd in overflow {
            record.queue.push_front(DownlinkItem::MacCommand(cmd));
        }
        let carries_adr = commands.iter().any(|c| matches!(c, MacCommand::LinkAdrReq { .. }));

        let fcnt = record.link.fcnt_down;
        let frame = DataFrame::seal(
            &FrameParams {
                direction: Direction::Down,
                confirmed: false,
                dev_addr,
                fcnt,
                fctrl: FCtrl {
                    ack: record.link.ack_pending,
                    f_pending: !record.queue.is_empty(),
                    ..FCtrl::default()
                },
                fport: port,
                payload: &payload,
                mac_commands: &commands,
            },
            &keys,
        )
        .map_err(|e| SimError::HandlerError {
            entity: self.id,
            message: e.to_string(),
        })?;
        record.link.fcnt_down = fcnt.wrapping_add(1);
        record.link.ack_pending = false;
        record.link.reply_required = false;
        trace!(
            "NetworkServer[{}]: downlink fcnt {} for {} at {}",
            self.config.name,
            fcnt,
            record.reg.name,
            ctx.time()
        );
        Ok(Some((frame.encode(), carries_adr)))
    }

    fn handle_downlink_opportunity(&mut self, dev_addr: DevAddr, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(idx) = self.by_addr.get(&dev_addr).copied() else {
            return Ok(());
        };
        {
            let record = &self.devices[idx];
            if record.queue.is_empty() && !record.link.wants_downlink() {
                return Ok(());
            }
        }
        let now = ctx.time();
        let Some(slot) = self.pick_slot(idx, now) else {
            trace!(
                "NetworkServer[{}]: no downlink slot for {} yet",
                self.config.name,
                self.devices[idx].reg.name
            );
            return Ok(());
        };
        let Some((bytes, carries_adr)) = self.build_downlink(idx, ctx)? else {
            return Ok(());
        };

        let params = RadioParams {
            frequency_hz: slot.frequency_hz,
            bandwidth_hz: self.config.plan.bandwidth_hz,
            spreading_factor: slot.spreading_factor,
            coding_rate: self.config.plan.coding_rate,
            // The gateway stamps its own power.
            tx_power_dbm: tx_power_dbm(0).unwrap_or(14.0),
        };
        let airtime = time_on_air(&params, bytes.len(), &self.config.phy);
        let record = &mut self.devices[idx];
        let tx = Transmission {
            id: ctx.next_transmission_id(),
            sender: slot.gateway,
            direction: Direction::Down,
            target: Some(record.reg.entity),
            params,
            start: slot.at,
            end: slot.at + airtime,
            frame: LoraFrame::new(bytes),
            attempt: 1,
        };
        if slot.from_last_uplink {
            if let Some(last) = record.link.last_uplink.as_mut() {
                last.consumed = true;
            }
        }
        let more = !record.queue.is_empty() && record.reg.class != DeviceClass::A;
        let device_name = record.reg.name.clone();
        debug!(
            "NetworkServer[{}]: downlink tx {} for {} via {} in {:?} at {}",
            self.config.name,
            tx.id,
            device_name,
            self.gateway_name(slot.gateway),
            slot.window,
            slot.at
        );
        self.gateway_busy_until.insert(slot.gateway, tx.end);

        if carries_adr {
            ctx.emit(
                OutputEvent::new(now, OutputKind::AdrCommandSent)
                    .device(device_name)
                    .gateway(self.gateway_name(slot.gateway))
                    .sf(slot.spreading_factor)
                    .airtime(airtime)
                    .detail(format!("{:?} at {}", slot.window, slot.at)),
            );
        }
        let end = tx.end;
        ctx.post_at(slot.at, vec![slot.gateway], EventPayload::DownlinkTx(tx));
        if more {
            ctx.post_at(end, vec![self.id], EventPayload::DownlinkOpportunity { dev_addr });
        }
        Ok(())
    }

    fn handle_timer(&mut self, timer_id: u64, ctx: &mut SimContext) {
        let idx = timer_id as usize;
        let Some(record) = self.devices.get_mut(idx) else {
            return;
        };
        let Some(interval) = record.reg.downlink_interval else {
            return;
        };
        ctx.post_event(interval, vec![self.id], EventPayload::Timer { timer_id });
        let Some(dev_addr) = record.dev_addr else {
            return;
        };
        let mut payload = vec![0u8; record.reg.downlink_payload_bytes];
        ctx.rng().fill(&mut payload[..]);
        record.queue.push(DownlinkItem::Application {
            port: APP_DOWNLINK_PORT,
            payload,
        });
        ctx.post_immediate(vec![self.id], EventPayload::DownlinkOpportunity { dev_addr });
    }
}

fn rejection_reason(error: &SecurityError) -> &'static str {
    match error {
        SecurityError::MicMismatch { .. } => "mic",
        SecurityError::DecryptionFailed(_) | SecurityError::InvalidKeyLength(_) => "decryption",
        SecurityError::UnknownDevice(_) => "unknown_device",
        SecurityError::ReplayedNonce { .. } => "replayed_nonce",
        SecurityError::StaleFrameCounter { .. } => "stale_fcnt",
    }
}

impl Entity for NetworkServer {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::UplinkForward(forward) => self.handle_uplink(forward, ctx)?,
            EventPayload::AggregationClose(key) => self.handle_aggregation_close(key, ctx),
            EventPayload::AdrEvaluate { dev_addr } => self.handle_adr_evaluate(*dev_addr, ctx),
            EventPayload::DownlinkOpportunity { dev_addr } => self.handle_downlink_opportunity(*dev_addr, ctx)?,
            EventPayload::Timer { timer_id } => self.handle_timer(*timer_id, ctx),
            _ => {}
        }
        Ok(())
    }
}
