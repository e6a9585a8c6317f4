//! Shared helpers for the runner integration tests.

#![allow(dead_code)]

use lorasim_common::{OutputEvent, OutputKind};
use lorasim_runner::{
    build_simulation, load_scenario_from_str, DispatchRecord, EndCondition, EventLoop, SimulationStats, TxRecord,
};

pub const NWK_SKEY: &str = "2B7E151628AED2A6ABF7158809CF4F3C";
pub const APP_SKEY: &str = "3C4FCF098815F7ABA6D2AE2816157E2B";
pub const APP_KEY: &str = "00112233445566778899AABBCCDDEEFF";

/// Channel section without shadowing or fading: path loss is
/// `reference_loss_db + 20 log10(d)`, so a device 1 m from its gateway sees
/// exactly `reference_loss_db`.
pub fn fixed_channel(reference_loss_db: f64) -> String {
    format!(
        r#"channel:
  environment:
    path_loss_exponent: 2.0
    shadowing_std_db: 0.0
    reference_loss_db: {reference_loss_db}
    reference_distance_m: 1.0
  channels: [868100000]
"#
    )
}

/// An ABP device entry. `extra` is appended to its `settings` block and must
/// be indented by six spaces.
pub fn abp_device(name: &str, dev_addr: &str, x: f64, extra: &str) -> String {
    format!(
        r#"  - name: {name}
    position: {{ x: {x}, y: 0 }}
    activation:
      mode: abp
      dev_addr: "{dev_addr}"
      nwk_skey: "{NWK_SKEY}"
      app_skey: "{APP_SKEY}"
    settings:
{extra}"#
    )
}

pub struct RunResult {
    pub stats: SimulationStats,
    pub outputs: Vec<OutputEvent>,
    pub log: Vec<DispatchRecord>,
}

impl RunResult {
    /// Uplinks put on air by one device, in order.
    pub fn uplinks(&self, device: &str) -> Vec<TxRecord> {
        self.log
            .iter()
            .filter_map(|r| r.transmission.clone())
            .filter(|t| t.direction == "up" && t.sender == device)
            .collect()
    }

    /// Start times (us) of the uplinks in [`RunResult::uplinks`].
    pub fn uplink_starts(&self, device: &str) -> Vec<u64> {
        self.log
            .iter()
            .filter(|r| {
                r.transmission
                    .as_ref()
                    .map(|t| t.direction == "up" && t.sender == device)
                    .unwrap_or(false)
            })
            .map(|r| r.time_us)
            .collect()
    }

    pub fn outputs_of(&self, kind: OutputKind, device: &str) -> Vec<&OutputEvent> {
        self.outputs
            .iter()
            .filter(|o| o.kind == kind && o.device.as_deref() == Some(device))
            .collect()
    }
}

/// Build and run a scenario with its own seed.
pub fn run(yaml: &str, end: EndCondition) -> RunResult {
    let scenario = load_scenario_from_str(yaml).unwrap();
    let seed = scenario.simulation.seed;
    let mut ev = EventLoop::new(build_simulation(&scenario, seed).unwrap(), seed, None).with_dispatch_log();
    let stats = ev.run_until(end).unwrap();
    RunResult {
        stats,
        outputs: ev.outputs().to_vec(),
        log: ev.dispatch_log().unwrap().to_vec(),
    }
}
