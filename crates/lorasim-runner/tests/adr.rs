//! Network-side ADR and the device-side ADR_ACK back-off, end to end.

mod common;

use common::{abp_device, fixed_channel, run};
use lorasim_common::OutputKind;
use lorasim_runner::EndCondition;

fn scenario(reference_loss_db: f64, network: &str, gateway_power: f64, settings: &str) -> String {
    format!(
        "simulation:\n  seed: 21\n{}network:\n{}gateways:\n  - name: gw-0\n    position: {{ x: 0, y: 0 }}\n    tx_power_dbm: {}\ndevices:\n{}",
        fixed_channel(reference_loss_db),
        network,
        gateway_power,
        abp_device("dev", "26011C00", 1.0, settings)
    )
}

const SF12: &str = "      spreading_factor: 12
      traffic:
        interval_s: 120
";

/// Number of times the SF changes between consecutive uplinks.
fn sf_changes(sfs: &[u8]) -> usize {
    sfs.windows(2).filter(|w| w[0] != w[1]).count()
}

#[test]
fn test_single_link_adr_command() {
    // 135 dB loss: SNR about -4 dB, 16 dB above the SF12 floor
    let result = run(&scenario(135.0, "  adr: true\n", 14.0, SF12), EndCondition::PacketCount(50));

    assert_eq!(result.outputs_of(OutputKind::AdrCommandSent, "dev").len(), 1);
    assert_eq!(result.stats.adr_commands, 1);

    let sfs: Vec<u8> = result.uplinks("dev").iter().map(|t| t.spreading_factor).collect();
    assert!(sfs.len() >= 50);
    // twenty samples before the decision
    assert!(sfs[..20].iter().all(|&sf| sf == 12));
    assert_eq!(sf_changes(&sfs), 1);
    let last = *sfs.last().unwrap();
    assert!(last < 12 && last >= 7, "settled at SF{}", last);
}

#[test]
fn test_adr_never_goes_below_sf7() {
    // very strong link: the first decision already reaches SF7
    let result = run(&scenario(100.0, "  adr: true\n", 14.0, SF12), EndCondition::PacketCount(60));

    let sfs: Vec<u8> = result.uplinks("dev").iter().map(|t| t.spreading_factor).collect();
    assert!(sfs.iter().all(|&sf| (7..=12).contains(&sf)));
    let first_sf7 = sfs.iter().position(|&sf| sf == 7).expect("device never reached SF7");
    assert!(sfs[first_sf7..].iter().all(|&sf| sf == 7));
    assert!(result.stats.adr_commands >= 1);
}

/// The server runs no ADR and the gateway's downlinks never reach the
/// device, so the device hears nothing after its ADRACKReq.
fn silent_network(settings: &str) -> String {
    scenario(100.0, "  adr: false\n", -80.0, settings)
}

fn fallback_fcnts(result: &common::RunResult) -> Vec<Option<u32>> {
    result
        .outputs_of(OutputKind::AdrFallback, "dev")
        .iter()
        .map(|o| o.fcnt)
        .collect()
}

#[test]
fn test_adr_ack_backoff_reverts_once() {
    let settings = "      spreading_factor: 7
      traffic:
        interval_s: 60
";
    let result = run(&silent_network(settings), EndCondition::PacketCount(110));

    assert!(result.outputs_of(OutputKind::DownlinkReceived, "dev").is_empty());
    // 64 + 32 uplinks, then exactly one revert
    assert_eq!(fallback_fcnts(&result), vec![Some(95)]);
    assert_eq!(result.stats.devices["dev"].adr_fallbacks, 1);

    // the configured settings were never changed, so reverting keeps them
    let sfs: Vec<u8> = result.uplinks("dev").iter().map(|t| t.spreading_factor).collect();
    assert!(sfs.len() >= 110);
    assert_eq!(sf_changes(&sfs), 0);
    let power: Vec<f64> = result.uplinks("dev").iter().map(|t| t.tx_power_dbm).collect();
    assert!(power.iter().all(|p| (*p - power[0]).abs() < 1e-9));
}

#[test]
fn test_adr_ack_backoff_uses_configured_limit_and_delay() {
    let settings = "      spreading_factor: 9
      adr_ack_limit: 8
      adr_ack_delay: 4
      traffic:
        interval_s: 60
";
    let result = run(&silent_network(settings), EndCondition::PacketCount(30));

    // every 8 + 4 silent uplinks, counting restarts after each revert
    assert_eq!(fallback_fcnts(&result), vec![Some(11), Some(23)]);
    let fallback = result.outputs_of(OutputKind::AdrFallback, "dev")[0];
    assert_eq!(fallback.sf, Some(9));
}

#[test]
fn test_adr_ack_keys_from_defaults_block() {
    let yaml = silent_network(
        "      spreading_factor: 7
      traffic:
        interval_s: 60
",
    )
    .replace("devices:\n", "defaults:\n  adr_ack_limit: 16\n  adr_ack_delay: 12\ndevices:\n");
    let result = run(&yaml, EndCondition::PacketCount(40));
    assert_eq!(fallback_fcnts(&result), vec![Some(27)]);
}
