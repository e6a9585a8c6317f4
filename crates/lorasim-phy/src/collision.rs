//! Interference tracking and capture decisions.
//!
//! Every receiver keeps a [`CollisionResolver`]. Receptions are registered
//! when they start; each registration records the newcomer in the
//! interferer set of every overlapping active reception and vice versa. The
//! verdict for a reception is taken when it ends, from its complete set, so
//! it does not depend on the order in which receptions were registered.

use crate::{symbol_time_secs, MIN_SF};
use lorasim_common::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// FLoRa inter-SF capture thresholds in dB, indexed `[target SF-7][interferer SF-7]`.
///
/// The diagonal is replaced by the configured same-SF threshold.
pub const NON_ORTH_DELTA: [[f64; 6]; 6] = [
    [1.0, -8.0, -9.0, -9.0, -9.0, -9.0],
    [-11.0, 1.0, -11.0, -12.0, -13.0, -13.0],
    [-15.0, -13.0, 1.0, -13.0, -14.0, -15.0],
    [-19.0, -18.0, -17.0, 1.0, -17.0, -18.0],
    [-22.0, -22.0, -21.0, -20.0, 1.0, -20.0],
    [-25.0, -25.0, -25.0, -24.0, -23.0, 1.0],
];

/// Collision model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollisionConfig {
    /// Power margin needed to survive a same-SF interferer.
    #[serde(default = "default_capture_threshold")]
    pub capture_threshold_db: f64,
    /// Preamble symbols the receiver needs intact to lock.
    #[serde(default = "default_capture_symbols")]
    pub capture_preamble_symbols: u32,
    /// Overlaps shorter than this are ignored (seconds).
    #[serde(default)]
    pub min_interference_s: f64,
    /// Treat different SFs as non-interfering.
    #[serde(default = "default_true")]
    pub orthogonal_sf: bool,
}

fn default_capture_threshold() -> f64 {
    6.0
}

fn default_capture_symbols() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for CollisionConfig {
    fn default() -> Self {
        CollisionConfig {
            capture_threshold_db: default_capture_threshold(),
            capture_preamble_symbols: default_capture_symbols(),
            min_interference_s: 0.0,
            orthogonal_sf: true,
        }
    }
}

impl CollisionConfig {
    /// Margin a target on `target_sf` needs over an interferer on `interferer_sf`.
    pub fn capture_threshold(&self, target_sf: u8, interferer_sf: u8) -> f64 {
        if target_sf == interferer_sf {
            return self.capture_threshold_db;
        }
        let t = (target_sf.saturating_sub(MIN_SF) as usize).min(5);
        let i = (interferer_sf.saturating_sub(MIN_SF) as usize).min(5);
        NON_ORTH_DELTA[t][i]
    }
}

/// What a receiver knows about one reception.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceptionSnapshot {
    pub transmission_id: u64,
    pub frequency_hz: u32,
    pub bandwidth_hz: u32,
    pub spreading_factor: u8,
    pub start: SimTime,
    pub end: SimTime,
    pub rssi_dbm: f64,
}

/// Verdict for a finished reception.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollisionOutcome {
    /// No relevant interferer, or the capture margin held.
    Decodable {
        /// Interferers that overlapped the critical section.
        interferers: usize,
    },
    /// Destroyed by interference.
    Collided {
        interferers: usize,
        /// Power margin over the combined interference.
        margin_db: f64,
        /// Margin that would have been needed.
        required_db: f64,
    },
}

impl CollisionOutcome {
    pub fn is_decodable(&self) -> bool {
        matches!(self, CollisionOutcome::Decodable { .. })
    }
}

#[derive(Debug, Clone)]
struct ActiveReception {
    snapshot: ReceptionSnapshot,
    interferers: Vec<ReceptionSnapshot>,
}

/// Per-receiver channel occupancy and capture logic.
#[derive(Debug, Clone)]
pub struct CollisionResolver {
    config: CollisionConfig,
    preamble_symbols: u32,
    // frequency -> transmission id -> reception
    active: BTreeMap<u32, BTreeMap<u64, ActiveReception>>,
}

impl CollisionResolver {
    pub fn new(config: CollisionConfig, preamble_symbols: u32) -> Self {
        CollisionResolver {
            config,
            preamble_symbols,
            active: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Number of receptions currently on air.
    pub fn active_count(&self) -> usize {
        self.active.values().map(|m| m.len()).sum()
    }

    /// True if any reception is active on `frequency_hz`.
    pub fn is_busy(&self, frequency_hz: u32) -> bool {
        self.active.get(&frequency_hz).map(|m| !m.is_empty()).unwrap_or(false)
    }

    fn interferes(&self, a: &ReceptionSnapshot, b: &ReceptionSnapshot) -> bool {
        if a.frequency_hz != b.frequency_hz {
            return false;
        }
        if self.config.orthogonal_sf && a.spreading_factor != b.spreading_factor {
            return false;
        }
        let overlap_start = a.start.max(b.start);
        let overlap_end = a.end.min(b.end);
        if overlap_end <= overlap_start {
            return false;
        }
        (overlap_end - overlap_start).as_secs_f64() >= self.config.min_interference_s
    }

    /// Register a reception that starts now.
    pub fn add(&mut self, snapshot: ReceptionSnapshot) {
        let mut interferers = Vec::new();
        let overlapping: Vec<u64> = self
            .active
            .get(&snapshot.frequency_hz)
            .map(|m| {
                m.values()
                    .filter(|other| self.interferes(&snapshot, &other.snapshot))
                    .map(|other| other.snapshot.transmission_id)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(on_freq) = self.active.get_mut(&snapshot.frequency_hz) {
            for id in overlapping {
                if let Some(other) = on_freq.get_mut(&id) {
                    other.interferers.push(snapshot);
                    interferers.push(other.snapshot);
                }
            }
        }

        self.active.entry(snapshot.frequency_hz).or_default().insert(
            snapshot.transmission_id,
            ActiveReception {
                snapshot,
                interferers,
            },
        );
    }

    /// Remove a reception at its end and decide whether it survived.
    ///
    /// Returns `None` for an unknown transmission.
    pub fn finish(&mut self, transmission_id: u64) -> Option<(ReceptionSnapshot, CollisionOutcome)> {
        let freq = self
            .active
            .iter()
            .find(|(_, m)| m.contains_key(&transmission_id))
            .map(|(f, _)| *f)?;
        let on_freq = self.active.get_mut(&freq)?;
        let reception = on_freq.remove(&transmission_id)?;
        if on_freq.is_empty() {
            self.active.remove(&freq);
        }
        let outcome = self.resolve(&reception.snapshot, &reception.interferers);
        Some((reception.snapshot, outcome))
    }

    /// Capture decision for `target` against a set of overlapping receptions.
    pub fn resolve(&self, target: &ReceptionSnapshot, interferers: &[ReceptionSnapshot]) -> CollisionOutcome {
        let t_sym = symbol_time_secs(target.spreading_factor, target.bandwidth_hz);
        let lock_symbols = self.preamble_symbols.saturating_sub(self.config.capture_preamble_symbols);
        let critical_start = target.start + SimTime::from_secs(t_sym * lock_symbols as f64);

        let mut interference_mw = 0.0;
        let mut required_db = f64::NEG_INFINITY;
        let mut relevant = 0;
        for i in interferers {
            if i.end <= critical_start {
                continue;
            }
            relevant += 1;
            interference_mw += 10f64.powf(i.rssi_dbm / 10.0);
            required_db = required_db.max(self.config.capture_threshold(target.spreading_factor, i.spreading_factor));
        }

        if relevant == 0 {
            return CollisionOutcome::Decodable { interferers: 0 };
        }
        let margin_db = target.rssi_dbm - 10.0 * interference_mw.log10();
        if margin_db >= required_db {
            CollisionOutcome::Decodable { interferers: relevant }
        } else {
            CollisionOutcome::Collided {
                interferers: relevant,
                margin_db,
                required_db,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snap(id: u64, sf: u8, start_ms: u64, end_ms: u64, rssi: f64) -> ReceptionSnapshot {
        ReceptionSnapshot {
            transmission_id: id,
            frequency_hz: 868_100_000,
            bandwidth_hz: 125_000,
            spreading_factor: sf,
            start: SimTime::from_millis(start_ms),
            end: SimTime::from_millis(end_ms),
            rssi_dbm: rssi,
        }
    }

    fn resolver() -> CollisionResolver {
        CollisionResolver::new(CollisionConfig::default(), 8)
    }

    #[test]
    fn test_capture_stronger_survives() {
        let mut r = resolver();
        r.add(snap(1, 7, 0, 100, -100.0));
        r.add(snap(2, 7, 0, 100, -110.0));
        let (_, strong) = r.finish(1).unwrap();
        let (_, weak) = r.finish(2).unwrap();
        assert!(strong.is_decodable());
        assert!(!weak.is_decodable());
        assert_eq!(r.active_count(), 0);
    }

    #[test]
    fn test_equal_power_both_destroyed() {
        let mut r = resolver();
        r.add(snap(1, 9, 0, 200, -100.0));
        r.add(snap(2, 9, 50, 250, -100.0));
        assert!(!r.finish(1).unwrap().1.is_decodable());
        assert!(!r.finish(2).unwrap().1.is_decodable());
    }

    #[test]
    fn test_orthogonal_sf_ignored() {
        let mut r = resolver();
        r.add(snap(1, 7, 0, 100, -100.0));
        r.add(snap(2, 8, 0, 100, -90.0));
        assert_eq!(r.finish(1).unwrap().1, CollisionOutcome::Decodable { interferers: 0 });
    }

    #[test]
    fn test_non_orthogonal_table() {
        let cfg = CollisionConfig {
            orthogonal_sf: false,
            ..CollisionConfig::default()
        };
        assert_eq!(cfg.capture_threshold(7, 7), 6.0);
        assert_eq!(cfg.capture_threshold(7, 8), -8.0);
        assert_eq!(cfg.capture_threshold(12, 7), -25.0);
        let mut r = CollisionResolver::new(cfg, 8);
        // SF12 target tolerates an SF7 interferer up to 25 dB stronger.
        r.add(snap(1, 12, 0, 1000, -110.0));
        r.add(snap(2, 7, 100, 160, -90.0));
        assert!(r.finish(2).unwrap().1.is_decodable());
        assert!(r.finish(1).unwrap().1.is_decodable());
    }

    #[test]
    fn test_interferer_ending_in_preamble_is_ignored() {
        let mut r = resolver();
        // SF7 symbol is 1.024 ms; critical section starts after 3 symbols.
        r.add(snap(2, 7, 0, 2, -90.0));
        r.add(snap(1, 7, 1, 60, -100.0));
        let (_, outcome) = r.finish(1).unwrap();
        assert_eq!(outcome, CollisionOutcome::Decodable { interferers: 0 });
    }

    #[test]
    fn test_late_stronger_destroys_earlier() {
        let mut r = resolver();
        r.add(snap(1, 7, 0, 100, -110.0));
        r.add(snap(2, 7, 80, 180, -95.0));
        assert!(!r.finish(1).unwrap().1.is_decodable());
        assert!(r.finish(2).unwrap().1.is_decodable());
    }

    #[test]
    fn test_min_interference_time() {
        let cfg = CollisionConfig {
            min_interference_s: 0.05,
            ..CollisionConfig::default()
        };
        let mut r = CollisionResolver::new(cfg, 8);
        r.add(snap(1, 7, 0, 100, -100.0));
        r.add(snap(2, 7, 90, 190, -100.0));
        assert!(r.finish(1).unwrap().1.is_decodable());
        assert!(r.finish(2).unwrap().1.is_decodable());
    }

    #[test]
    fn test_combined_interference_sums_power() {
        let r = resolver();
        let target = snap(1, 7, 0, 100, -100.0);
        // Each interferer alone leaves 7 dB; together about 4 dB.
        let i1 = snap(2, 7, 0, 100, -107.0);
        let i2 = snap(3, 7, 0, 100, -107.0);
        assert!(r.resolve(&target, &[i1]).is_decodable());
        assert!(!r.resolve(&target, &[i1, i2]).is_decodable());
    }

    #[test]
    fn test_finish_unknown_is_none() {
        let mut r = resolver();
        assert!(r.finish(42).is_none());
    }

    proptest! {
        #[test]
        fn test_outcomes_independent_of_insertion_order(
            rssis in proptest::collection::vec(-130.0f64..-80.0, 2..6),
            starts in proptest::collection::vec(0u64..200, 6),
        ) {
            let snaps: Vec<ReceptionSnapshot> = rssis
                .iter()
                .enumerate()
                .map(|(i, rssi)| snap(i as u64, 7, starts[i], starts[i] + 150, *rssi))
                .collect();

            let run = |order: Vec<usize>| {
                let mut r = resolver();
                for i in &order {
                    r.add(snaps[*i]);
                }
                let mut out: Vec<(u64, bool)> = order
                    .iter()
                    .map(|i| (snaps[*i].transmission_id, r.finish(snaps[*i].transmission_id).unwrap().1.is_decodable()))
                    .collect();
                out.sort();
                out
            };
            let forward: Vec<usize> = (0..snaps.len()).collect();
            let backward: Vec<usize> = (0..snaps.len()).rev().collect();
            prop_assert_eq!(run(forward), run(backward));
        }
    }
}
