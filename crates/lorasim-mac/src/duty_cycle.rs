//! Sliding-window duty-cycle accounting.

use lorasim_common::{ConfigError, SimTime};
use std::collections::VecDeque;
use thiserror::Error;

/// Duty-cycle limit: at most `quota × window` of airtime in any window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutyCycleConfig {
    pub quota: f64,
    pub window: SimTime,
}

impl DutyCycleConfig {
    pub fn new(quota: f64, window: SimTime) -> Result<Self, ConfigError> {
        if !(quota > 0.0 && quota <= 1.0) {
            return Err(ConfigError::invalid("duty_cycle.quota", format!("{} not in (0, 1]", quota)));
        }
        if window == SimTime::ZERO {
            return Err(ConfigError::invalid("duty_cycle.window", "must be positive"));
        }
        Ok(DutyCycleConfig { quota, window })
    }

    /// Airtime budget per window.
    pub fn budget(&self) -> SimTime {
        SimTime::from_micros((self.window.as_micros() as f64 * self.quota).floor() as u64)
    }
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        DutyCycleConfig {
            quota: 0.01,
            window: SimTime::from_secs(3600.0),
        }
    }
}

/// A transmission that does not fit the budget yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DutyCycleError {
    #[error("Duty-cycle budget exhausted, retry at {retry_at}")]
    ResourceExhausted { retry_at: SimTime },
}

/// Record of past emissions for one device.
#[derive(Debug, Clone)]
pub struct DutyCycleLedger {
    config: DutyCycleConfig,
    // network-imposed aggregated limit (DutyCycleReq)
    max_aggregated: Option<f64>,
    emissions: VecDeque<(SimTime, SimTime)>,
}

impl DutyCycleLedger {
    pub fn new(config: DutyCycleConfig) -> Self {
        DutyCycleLedger {
            config,
            max_aggregated: None,
            emissions: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DutyCycleConfig {
        &self.config
    }

    /// Apply a network-imposed limit of `1 / 2^max_duty_cycle`; 0 removes it.
    pub fn set_max_aggregated(&mut self, max_duty_cycle: u8) {
        self.max_aggregated = if max_duty_cycle == 0 {
            None
        } else {
            Some(1.0 / 2f64.powi(max_duty_cycle.min(15) as i32))
        };
    }

    fn budget_us(&self) -> u64 {
        let quota = match self.max_aggregated {
            Some(q) => q.min(self.config.quota),
            None => self.config.quota,
        };
        (self.config.window.as_micros() as f64 * quota).floor() as u64
    }

    /// Airtime recorded inside `[from, to)`.
    pub fn usage(&self, from: SimTime, to: SimTime) -> SimTime {
        let total = self
            .emissions
            .iter()
            .map(|(s, e)| {
                let lo = (*s).max(from);
                let hi = (*e).min(to);
                (hi - lo).as_micros()
            })
            .sum();
        SimTime::from_micros(total)
    }

    fn fits_at(&self, start: SimTime, airtime: SimTime) -> bool {
        let end = start + airtime;
        let window_start = end - self.config.window;
        self.usage(window_start, end).as_micros() + airtime.as_micros() <= self.budget_us()
    }

    /// Earliest start time, not before `now`, at which `airtime` fits.
    pub fn earliest_start(&self, now: SimTime, airtime: SimTime) -> SimTime {
        if self.fits_at(now, airtime) {
            return now;
        }
        // Usage only drops as the window slides past history, so the
        // predicate is monotone in the start time.
        let mut lo = now.as_micros();
        let mut hi = now.as_micros() + self.config.window.as_micros();
        if !self.fits_at(SimTime::from_micros(hi), airtime) {
            return SimTime::from_micros(hi);
        }
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.fits_at(SimTime::from_micros(mid), airtime) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        SimTime::from_micros(hi)
    }

    /// Reserve airtime starting now, or report when it will fit.
    pub fn try_reserve(&mut self, now: SimTime, airtime: SimTime) -> Result<(), DutyCycleError> {
        self.prune(now);
        let start = self.earliest_start(now, airtime);
        if start > now {
            return Err(DutyCycleError::ResourceExhausted { retry_at: start });
        }
        self.emissions.push_back((now, now + airtime));
        Ok(())
    }

    fn prune(&mut self, now: SimTime) {
        let horizon = now - self.config.window;
        while let Some((_, end)) = self.emissions.front() {
            if *end <= horizon {
                self.emissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fraction of the window used in the window ending at `now`.
    pub fn utilisation(&self, now: SimTime) -> f64 {
        let window = self.config.window;
        self.usage(now - window, now).as_micros() as f64 / window.as_micros() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ledger(quota: f64, window_s: f64) -> DutyCycleLedger {
        DutyCycleLedger::new(DutyCycleConfig::new(quota, SimTime::from_secs(window_s)).unwrap())
    }

    #[test]
    fn test_reserve_within_budget() {
        let mut l = ledger(0.01, 100.0);
        assert!(l.try_reserve(SimTime::ZERO, SimTime::from_millis(500)).is_ok());
        assert!(l.try_reserve(SimTime::from_secs(1.0), SimTime::from_millis(500)).is_ok());
        let err = l.try_reserve(SimTime::from_secs(2.0), SimTime::from_millis(500)).unwrap_err();
        let DutyCycleError::ResourceExhausted { retry_at } = err;
        // The first emission must leave the window before 0.5 s more fits.
        assert_eq!(retry_at, SimTime::from_secs(100.0));
    }

    #[test]
    fn test_retry_at_fits() {
        let mut l = ledger(0.01, 100.0);
        l.try_reserve(SimTime::ZERO, SimTime::from_secs(1.0)).unwrap();
        let DutyCycleError::ResourceExhausted { retry_at } =
            l.try_reserve(SimTime::from_secs(10.0), SimTime::from_millis(200)).unwrap_err();
        assert!(l.try_reserve(retry_at, SimTime::from_millis(200)).is_ok());
        assert!(retry_at > SimTime::from_secs(10.0));
    }

    #[test]
    fn test_network_limit_tightens_budget() {
        let mut l = ledger(0.5, 10.0);
        l.set_max_aggregated(4);
        assert!(l.try_reserve(SimTime::ZERO, SimTime::from_millis(600)).is_ok());
        assert!(l.try_reserve(SimTime::from_secs(1.0), SimTime::from_millis(100)).is_err());
        l.set_max_aggregated(0);
        assert!(l.try_reserve(SimTime::from_secs(1.0), SimTime::from_millis(100)).is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(DutyCycleConfig::new(0.0, SimTime::from_secs(1.0)).is_err());
        assert!(DutyCycleConfig::new(0.1, SimTime::ZERO).is_err());
    }

    proptest! {
        #[test]
        fn test_no_window_exceeds_quota(
            requests in proptest::collection::vec((0u64..5_000, 10u64..400), 1..60),
        ) {
            let mut l = ledger(0.05, 10.0);
            let mut now = SimTime::ZERO;
            let mut accepted = Vec::new();
            for (gap_ms, airtime_ms) in requests {
                now = now + SimTime::from_millis(gap_ms);
                let airtime = SimTime::from_millis(airtime_ms);
                let start = match l.try_reserve(now, airtime) {
                    Ok(()) => now,
                    Err(DutyCycleError::ResourceExhausted { retry_at }) => {
                        prop_assert!(retry_at > now);
                        prop_assert!(l.try_reserve(retry_at, airtime).is_ok());
                        retry_at
                    }
                };
                accepted.push((start, start + airtime));
                now = start + airtime;
            }
            let budget = SimTime::from_secs(10.0 * 0.05).as_micros();
            for (_, end) in &accepted {
                let from = *end - SimTime::from_secs(10.0);
                let used: u64 = accepted
                    .iter()
                    .map(|(s, e)| ((*e).min(*end) - (*s).max(from)).as_micros())
                    .sum();
                prop_assert!(used <= budget, "used {} budget {}", used, budget);
            }
        }
    }
}
