//! Over-the-air activation followed by data traffic.

mod common;

use common::{fixed_channel, run, APP_KEY};
use lorasim_common::OutputKind;
use lorasim_runner::EndCondition;

fn scenario(devices: u32) -> String {
    format!(
        r#"simulation:
  seed: 8
{}gateways:
  - name: gw-0
    position: {{ x: 0, y: 0 }}
devices:
  - name: otaa
    count: {devices}
    position: {{ x: 1, y: 0 }}
    activation:
      mode: otaa
      dev_eui: "0004A30B001C0100"
      join_eui: "70B3D57ED0000000"
      app_key: "{APP_KEY}"
    settings:
      spreading_factor: 9
      traffic:
        interval_s: 300
"#,
        fixed_channel(100.0)
    )
}

#[test]
fn test_join_then_data_delivered() {
    let result = run(&scenario(1), EndCondition::PacketCount(3));

    let joined = result.outputs_of(OutputKind::Joined, "otaa-0");
    assert_eq!(joined.len(), 1);
    assert_eq!(result.stats.joins, 1);
    assert_eq!(result.stats.join_rejected, 0);

    let delivered = result.outputs_of(OutputKind::Delivered, "otaa-0");
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|d| d.time > joined[0].time));
    let fcnts: Vec<Option<u32>> = delivered.iter().map(|d| d.fcnt).collect();
    assert_eq!(fcnts, vec![Some(0), Some(1), Some(2)]);

    // the join request precedes every data frame on air
    let uplinks = result.uplinks("otaa-0");
    assert_eq!(uplinks[0].mtype, "join_request");
    assert!(uplinks[1..].iter().all(|t| t.mtype != "join_request"));
    assert_eq!(result.stats.devices["otaa-0"].data_uplinks, 3);
}

#[test]
fn test_group_members_join_independently() {
    let result = run(&scenario(3), EndCondition::PacketCount(6));
    for i in 0..3 {
        let name = format!("otaa-{}", i);
        assert_eq!(result.outputs_of(OutputKind::Joined, &name).len(), 1, "{}", name);
        let addr = result.outputs_of(OutputKind::Joined, &name)[0].detail.clone();
        assert!(addr.is_some());
    }
    let mut addrs: Vec<String> = (0..3)
        .filter_map(|i| result.outputs_of(OutputKind::Joined, &format!("otaa-{}", i))[0].detail.clone())
        .collect();
    addrs.sort();
    addrs.dedup();
    assert_eq!(addrs.len(), 3);
}
