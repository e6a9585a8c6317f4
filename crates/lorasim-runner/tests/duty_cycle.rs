//! Airtime inside any sliding window never exceeds the duty-cycle budget.

mod common;

use common::{abp_device, fixed_channel, run};
use lorasim_common::OutputKind;
use lorasim_runner::{EndCondition, SimTime};
use proptest::prelude::*;

fn scenario(seed: u64, quota: f64, window_s: f64, interval_s: f64, sf: u8) -> String {
    let settings = format!(
        "      spreading_factor: {sf}
      adr: false
      duty_cycle:
        quota: {quota}
        window_s: {window_s}
      traffic:
        model: poisson
        interval_s: {interval_s}
"
    );
    format!(
        "simulation:\n  seed: {}\n{}network:\n  adr: false\ngateways:\n  - name: gw-0\n    position: {{ x: 0, y: 0 }}\ndevices:\n{}",
        seed,
        fixed_channel(100.0),
        abp_device("dev", "26011D00", 1.0, &settings)
    )
}

/// Largest airtime (us) found in any window of `window_us` ending at an
/// uplink's end, which is where the sliding sum peaks.
fn max_window_airtime(spans: &[(u64, u64)], window_us: u64) -> u64 {
    spans
        .iter()
        .map(|&(_, end)| {
            let from = end.saturating_sub(window_us);
            spans
                .iter()
                .map(|&(s, e)| e.min(end).saturating_sub(s.max(from)))
                .sum::<u64>()
        })
        .max()
        .unwrap_or(0)
}

fn spans(result: &common::RunResult) -> Vec<(u64, u64)> {
    result
        .uplink_starts("dev")
        .into_iter()
        .zip(result.uplinks("dev"))
        .map(|(start, tx)| (start, start + tx.airtime_us))
        .collect()
}

#[test]
fn test_overloaded_device_is_deferred() {
    // SF12 frames every 5 s on average against a 10 % budget
    let yaml = scenario(3, 0.1, 100.0, 5.0, 12);
    let result = run(&yaml, EndCondition::Duration(SimTime::from_secs(2_000.0)));

    let spans = spans(&result);
    assert!(!spans.is_empty());
    assert!(!result.outputs_of(OutputKind::DutyCycleDeferred, "dev").is_empty());
    assert!(max_window_airtime(&spans, 100_000_000) <= 10_000_000);
    // deferral only delays: the budget is used, not wasted
    let total: u64 = spans.iter().map(|(s, e)| e - s).sum();
    assert!(total >= 10 * 10_000_000, "total airtime {}", total);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_window_airtime_within_quota(
        seed in 0u64..1_000,
        quota in 0.05f64..0.5,
        interval_s in 1.0f64..20.0,
        sf in 7u8..=12,
    ) {
        let window_s = 100.0;
        let yaml = scenario(seed, quota, window_s, interval_s, sf);
        let result = run(&yaml, EndCondition::Duration(SimTime::from_secs(1_000.0)));
        let budget_us = (window_s * 1e6 * quota).floor() as u64;
        prop_assert!(max_window_airtime(&spans(&result), 100_000_000) <= budget_us);
    }
}
