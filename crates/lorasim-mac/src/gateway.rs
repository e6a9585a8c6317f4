//! Gateway entity.
//!
//! A gateway tracks every uplink reaching it, decides at the end of each
//! reception whether it survived interference and the link error draw, and
//! forwards survivors to the network server over a fixed-latency backhaul.
//! It also puts server-scheduled downlinks on air.

use lorasim_common::metric_defs;
use lorasim_common::{
    Entity, EntityId, Event, EventPayload, OutputEvent, OutputKind, Reception, SimContext, SimError, SimTime,
    Transmission, UplinkForward,
};
use lorasim_phy::{CollisionConfig, CollisionOutcome, CollisionResolver, LoraPhyConfig, ReceptionSnapshot};
use lorawan_packet::PhyPayload;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    /// Network server entity.
    pub server: EntityId,
    /// Medium entity.
    pub medium: EntityId,
    /// Downlink transmit power.
    pub tx_power_dbm: f64,
    /// Gateway to server latency.
    pub backhaul_delay: SimTime,
    pub collision: CollisionConfig,
    pub phy: LoraPhyConfig,
}

/// A LoRaWAN gateway.
pub struct Gateway {
    id: EntityId,
    config: GatewayConfig,
    resolver: CollisionResolver,
    receptions: BTreeMap<u64, Reception>,
    device_names: Arc<BTreeMap<EntityId, String>>,
}

impl Gateway {
    pub fn new(id: EntityId, config: GatewayConfig, device_names: Arc<BTreeMap<EntityId, String>>) -> Self {
        let resolver = CollisionResolver::new(config.collision.clone(), config.phy.preamble_symbols);
        Gateway {
            id,
            config,
            resolver,
            receptions: BTreeMap::new(),
            device_names,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Receptions currently on air at this gateway.
    pub fn active_receptions(&self) -> usize {
        self.resolver.active_count()
    }

    fn device_name(&self, id: EntityId) -> String {
        self.device_names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("{}", id.0))
    }

    fn handle_reception_start(&mut self, reception: &Reception, ctx: &mut SimContext) {
        let tx = &reception.transmission;
        self.resolver.add(ReceptionSnapshot {
            transmission_id: tx.id,
            frequency_hz: tx.params.frequency_hz,
            bandwidth_hz: tx.params.bandwidth_hz,
            spreading_factor: tx.params.spreading_factor,
            start: tx.start,
            end: tx.end,
            rssi_dbm: reception.rssi_dbm,
        });
        self.receptions.insert(tx.id, reception.clone());
        ctx.post_at(
            tx.end,
            vec![self.id],
            EventPayload::ReceptionEnd {
                transmission_id: tx.id,
            },
        );
        trace!(
            "Gateway[{}]: rx start tx {} from {} sf {} rssi {:.1} dBm ({} active)",
            self.config.name,
            tx.id,
            self.device_name(tx.sender),
            tx.params.spreading_factor,
            reception.rssi_dbm,
            self.resolver.active_count()
        );
    }

    fn uplink_output(&self, kind: OutputKind, reception: &Reception, now: SimTime) -> OutputEvent {
        let tx = &reception.transmission;
        let mut out = OutputEvent::new(now, kind)
            .device(self.device_name(tx.sender))
            .gateway(self.config.name.clone())
            .sf(tx.params.spreading_factor)
            .signal(reception.rssi_dbm, reception.snr_db)
            .tx_power(tx.params.tx_power_dbm)
            .airtime(tx.airtime());
        if let Ok(PhyPayload::Data(frame)) = PhyPayload::decode(&tx.frame.bytes) {
            out = out.fcnt(frame.fcnt as u32);
        }
        out
    }

    fn handle_reception_end(&mut self, transmission_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some((_, outcome)) = self.resolver.finish(transmission_id) else {
            return Ok(());
        };
        let Some(reception) = self.receptions.remove(&transmission_id) else {
            return Ok(());
        };
        let labels = metric_defs::node_labels(&self.config.name);

        // Not even a preamble lock: nothing to report from this gateway.
        if reception.packet_error_rate >= 1.0 {
            trace!(
                "Gateway[{}]: tx {} below sensitivity (snr {:.1} dB)",
                self.config.name,
                transmission_id,
                reception.snr_db
            );
            return Ok(());
        }
        metrics::histogram!(metric_defs::GATEWAY_RX_SNR.name, &labels).record(reception.snr_db);

        if let CollisionOutcome::Collided {
            interferers,
            margin_db,
            required_db,
        } = outcome
        {
            debug!(
                "Gateway[{}]: tx {} collided ({} interferers, margin {:.1} dB < {:.1} dB)",
                self.config.name, transmission_id, interferers, margin_db, required_db
            );
            metrics::counter!(metric_defs::GATEWAY_RX_COLLIDED.name, &labels).increment(1);
            let out = self.uplink_output(OutputKind::Collided, &reception, ctx.time()).detail(format!(
                "{} interferers, margin {:.1} dB < {:.1} dB",
                interferers, margin_db, required_db
            ));
            ctx.emit(out);
            return Ok(());
        }

        let draw: f64 = ctx.rng().gen();
        if draw < reception.packet_error_rate {
            debug!(
                "Gateway[{}]: tx {} lost to bit errors (per {:.3})",
                self.config.name, transmission_id, reception.packet_error_rate
            );
            metrics::counter!(metric_defs::GATEWAY_RX_LOST.name, &labels).increment(1);
            let out = self
                .uplink_output(OutputKind::Lost, &reception, ctx.time())
                .detail(format!("packet error, per {:.3}", reception.packet_error_rate));
            ctx.emit(out);
            return Ok(());
        }

        metrics::counter!(metric_defs::GATEWAY_RX_PACKETS.name, &labels).increment(1);
        trace!(
            "Gateway[{}]: forwarding tx {} (snr {:.1} dB)",
            self.config.name,
            transmission_id,
            reception.snr_db
        );
        ctx.post_event(
            self.config.backhaul_delay,
            vec![self.config.server],
            EventPayload::UplinkForward(UplinkForward {
                gateway: self.id,
                reception,
            }),
        );
        Ok(())
    }

    fn handle_downlink_tx(&mut self, tx: &Transmission, ctx: &mut SimContext) {
        let airtime = tx.airtime();
        let mut tx = tx.clone();
        tx.sender = self.id;
        tx.start = ctx.time();
        tx.end = tx.start + airtime;
        tx.params.tx_power_dbm = self.config.tx_power_dbm;
        debug!(
            "Gateway[{}]: downlink tx {} to {} at {:.3} MHz sf {}",
            self.config.name,
            tx.id,
            tx.target.map(|t| self.device_name(t)).unwrap_or_default(),
            tx.params.frequency_hz as f64 / 1e6,
            tx.params.spreading_factor
        );
        metrics::counter!(metric_defs::GATEWAY_DOWNLINKS.name, &metric_defs::node_labels(&self.config.name))
            .increment(1);
        ctx.post_immediate(vec![self.config.medium], EventPayload::TxStart(tx));
    }
}

impl Entity for Gateway {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::ReceptionStart(reception) => self.handle_reception_start(reception, ctx),
            EventPayload::ReceptionEnd { transmission_id } => self.handle_reception_end(*transmission_id, ctx)?,
            EventPayload::DownlinkTx(tx) => self.handle_downlink_tx(tx, ctx),
            _ => {}
        }
        Ok(())
    }
}
