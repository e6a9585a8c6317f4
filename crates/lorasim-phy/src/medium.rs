//! The shared radio medium.
//!
//! Every transmission is posted to the medium, which evaluates the link to
//! each potential receiver at transmission start and forwards a
//! [`Reception`]: uplinks to every gateway, downlinks to their target device.

use crate::link::LinkEvaluator;
use crate::propagation::CorrelatedFading;
use lorasim_common::mobility::PositionSource;
use lorasim_common::{
    Direction, Entity, EntityId, Event, EventPayload, OutputEvent, OutputKind, Reception, SimContext, SimError,
    Transmission,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Parameters of the per-link correlated fading processes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FadingConfig {
    /// AR(1) coefficient in 0..=1.
    pub correlation: f64,
    #[serde(default)]
    pub mean_db: f64,
    pub std_db: f64,
}

/// Whether a radio site is a gateway or an end device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRole {
    Gateway,
    Device,
}

/// A radio known to the medium.
#[derive(Debug)]
pub struct RadioSite {
    pub name: String,
    pub role: SiteRole,
    pub position: Box<dyn PositionSource>,
}

/// Routes transmissions to receivers with evaluated link quality.
pub struct Medium {
    id: EntityId,
    evaluator: LinkEvaluator,
    sites: BTreeMap<EntityId, RadioSite>,
    fading: Option<FadingConfig>,
    links: BTreeMap<(EntityId, EntityId), CorrelatedFading>,
}

impl Medium {
    pub fn new(id: EntityId, evaluator: LinkEvaluator, fading: Option<FadingConfig>) -> Self {
        Medium {
            id,
            evaluator,
            sites: BTreeMap::new(),
            fading,
            links: BTreeMap::new(),
        }
    }

    /// Register a radio.
    pub fn add_site(&mut self, id: EntityId, site: RadioSite) {
        self.sites.insert(id, site);
    }

    pub fn evaluator(&self) -> &LinkEvaluator {
        &self.evaluator
    }

    fn site_name(&self, id: EntityId) -> String {
        self.sites
            .get(&id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("{}", id.0))
    }

    fn reception(&mut self, tx: &Transmission, receiver: EntityId, ctx: &mut SimContext) -> Result<Reception, SimError> {
        let now = ctx.time();
        let tx_pos = self
            .sites
            .get(&tx.sender)
            .ok_or(SimError::EntityNotFound(tx.sender))?
            .position
            .position_at(now);
        let rx_pos = self
            .sites
            .get(&receiver)
            .ok_or(SimError::EntityNotFound(receiver))?
            .position
            .position_at(now);

        let fading = match self.fading {
            Some(cfg) => {
                if !self.links.contains_key(&(tx.sender, receiver)) {
                    let process = CorrelatedFading::new(cfg.correlation, cfg.mean_db, cfg.std_db)?;
                    self.links.insert((tx.sender, receiver), process);
                }
                self.links.get_mut(&(tx.sender, receiver))
            }
            None => None,
        };

        let sample = self.evaluator.evaluate(
            &tx_pos,
            &rx_pos,
            tx.params.tx_power_dbm,
            tx.params.spreading_factor,
            tx.frame.len(),
            fading,
            ctx.rng(),
        )?;

        Ok(Reception {
            transmission: tx.clone(),
            receiver,
            rssi_dbm: sample.rssi_dbm,
            snr_db: sample.snr_db,
            packet_error_rate: sample.packet_error_rate,
        })
    }

    fn handle_uplink(&mut self, tx: &Transmission, ctx: &mut SimContext) -> Result<(), SimError> {
        let gateways: Vec<EntityId> = self
            .sites
            .iter()
            .filter(|(_, s)| s.role == SiteRole::Gateway)
            .map(|(id, _)| *id)
            .collect();

        let mut heard = false;
        for gw in gateways {
            let reception = self.reception(tx, gw, ctx)?;
            trace!(
                "Medium: tx {} {} -> {} rssi {:.1} dBm snr {:.1} dB",
                tx.id,
                self.site_name(tx.sender),
                self.site_name(gw),
                reception.rssi_dbm,
                reception.snr_db
            );
            heard |= reception.packet_error_rate < 1.0;
            ctx.post_immediate(vec![gw], EventPayload::ReceptionStart(reception));
        }

        if !heard {
            let device = self.site_name(tx.sender);
            debug!("Medium: uplink {} from {} below sensitivity at every gateway", tx.id, device);
            ctx.emit(
                OutputEvent::new(ctx.time(), OutputKind::Lost)
                    .device(device)
                    .sf(tx.params.spreading_factor)
                    .tx_power(tx.params.tx_power_dbm)
                    .airtime(tx.airtime())
                    .detail("below sensitivity"),
            );
        }
        Ok(())
    }

    fn handle_downlink(&mut self, tx: &Transmission, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(target) = tx.target else {
            debug!("Medium: downlink {} without target dropped", tx.id);
            return Ok(());
        };
        let reception = self.reception(tx, target, ctx)?;
        trace!(
            "Medium: downlink {} -> {} snr {:.1} dB",
            tx.id,
            self.site_name(target),
            reception.snr_db
        );
        ctx.post_immediate(vec![target], EventPayload::DownlinkArrival(reception));
        Ok(())
    }
}

impl Entity for Medium {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::TxStart(tx) = &event.payload {
            match tx.direction {
                Direction::Up => self.handle_uplink(tx, ctx)?,
                Direction::Down => self.handle_downlink(tx, ctx)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{select_error_model, AntennaGains, ErrorModelKind};
    use crate::propagation::Environment;
    use crate::LoraPhyConfig;
    use lorasim_common::mobility::Fixed;
    use lorasim_common::{LoraFrame, Position, RadioParams, SimTime};

    fn medium() -> Medium {
        let phy = LoraPhyConfig::default();
        let model = select_error_model(ErrorModelKind::Logistic, None, &phy, 125_000, 1);
        let env = Environment {
            shadowing_std_db: 0.0,
            ..Environment::URBAN
        };
        let eval = LinkEvaluator::new(env, AntennaGains::default(), -117.0, 1, model).unwrap();
        let mut m = Medium::new(EntityId(0), eval, None);
        m.add_site(
            EntityId(2),
            RadioSite {
                name: "gw".into(),
                role: SiteRole::Gateway,
                position: Box::new(Fixed(Position::new(0.0, 0.0))),
            },
        );
        m.add_site(
            EntityId(3),
            RadioSite {
                name: "dev".into(),
                role: SiteRole::Device,
                position: Box::new(Fixed(Position::new(100.0, 0.0))),
            },
        );
        m
    }

    fn tx(direction: Direction, sender: u64, target: Option<EntityId>) -> Transmission {
        Transmission {
            id: 1,
            sender: EntityId(sender),
            direction,
            target,
            params: RadioParams {
                frequency_hz: 868_100_000,
                bandwidth_hz: 125_000,
                spreading_factor: 7,
                coding_rate: 1,
                tx_power_dbm: 14.0,
            },
            start: SimTime::ZERO,
            end: SimTime::from_millis(50),
            frame: LoraFrame::new(vec![0x40; 20]),
            attempt: 1,
        }
    }

    fn event(payload: EventPayload) -> Event {
        Event {
            id: lorasim_common::EventId(0),
            time: SimTime::ZERO,
            source: EntityId(3),
            targets: vec![EntityId(0)],
            payload,
        }
    }

    #[test]
    fn test_uplink_routed_to_gateways() {
        let mut m = medium();
        let mut ctx = SimContext::new(1);
        m.handle_event(&event(EventPayload::TxStart(tx(Direction::Up, 3, None))), &mut ctx)
            .unwrap();
        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].targets, vec![EntityId(2)]);
        assert!(matches!(posted[0].payload, EventPayload::ReceptionStart(_)));
        assert!(ctx.take_outputs().is_empty());
    }

    #[test]
    fn test_downlink_routed_to_target() {
        let mut m = medium();
        let mut ctx = SimContext::new(1);
        m.handle_event(
            &event(EventPayload::TxStart(tx(Direction::Down, 2, Some(EntityId(3))))),
            &mut ctx,
        )
        .unwrap();
        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].targets, vec![EntityId(3)]);
        assert!(matches!(posted[0].payload, EventPayload::DownlinkArrival(_)));
    }

    #[test]
    fn test_out_of_range_uplink_is_lost() {
        let mut m = medium();
        m.add_site(
            EntityId(4),
            RadioSite {
                name: "far".into(),
                role: SiteRole::Device,
                position: Box::new(Fixed(Position::new(200_000.0, 0.0))),
            },
        );
        let mut ctx = SimContext::new(1);
        m.handle_event(&event(EventPayload::TxStart(tx(Direction::Up, 4, None))), &mut ctx)
            .unwrap();
        let outputs = ctx.take_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Lost);
        assert_eq!(outputs[0].device.as_deref(), Some("far"));
    }
}
