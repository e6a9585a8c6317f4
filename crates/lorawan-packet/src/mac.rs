//! MAC command codec.
//!
//! The same CID means different commands depending on direction: uplink
//! FOpts carry device answers (and a few device requests), downlink FOpts
//! carry network requests and answers.

use serde::{Deserialize, Serialize};

use crate::{Direction, PacketError};

/// MAC command identifiers.
pub mod cid {
    /// LinkCheckReq / LinkCheckAns.
    pub const LINK_CHECK: u8 = 0x02;
    /// LinkADRReq / LinkADRAns.
    pub const LINK_ADR: u8 = 0x03;
    /// DutyCycleReq / DutyCycleAns.
    pub const DUTY_CYCLE: u8 = 0x04;
    /// RXParamSetupReq / RXParamSetupAns.
    pub const RX_PARAM_SETUP: u8 = 0x05;
    /// DevStatusReq / DevStatusAns.
    pub const DEV_STATUS: u8 = 0x06;
    /// NewChannelReq / NewChannelAns.
    pub const NEW_CHANNEL: u8 = 0x07;
    /// RXTimingSetupReq / RXTimingSetupAns.
    pub const RX_TIMING_SETUP: u8 = 0x08;
    /// TxParamSetupReq / TxParamSetupAns.
    pub const TX_PARAM_SETUP: u8 = 0x09;
    /// DlChannelReq / DlChannelAns.
    pub const DL_CHANNEL: u8 = 0x0A;
    /// ADRParamSetupReq / ADRParamSetupAns.
    pub const ADR_PARAM_SETUP: u8 = 0x0C;
    /// DeviceTimeReq / DeviceTimeAns.
    pub const DEVICE_TIME: u8 = 0x0D;
    /// PingSlotInfoReq / PingSlotInfoAns.
    pub const PING_SLOT_INFO: u8 = 0x10;
}

/// A single MAC command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacCommand {
    // =========== Device → network ===========
    /// Device asks for link quality feedback.
    LinkCheckReq,
    /// Acknowledges a LinkADRReq. Bits: power, data rate, channel mask.
    LinkAdrAns {
        /// Power accepted.
        power_ack: bool,
        /// Data rate accepted.
        data_rate_ack: bool,
        /// Channel mask accepted.
        channel_mask_ack: bool,
    },
    /// Acknowledges a DutyCycleReq.
    DutyCycleAns,
    /// Acknowledges an RXParamSetupReq. Low three bits of the status byte.
    RxParamSetupAns {
        /// Status bits.
        status: u8,
    },
    /// Battery level and demodulation margin.
    DevStatusAns {
        /// 0 external power, 1..=254 level, 255 unknown.
        battery: u8,
        /// SNR margin of the last downlink, 6-bit signed.
        margin: i8,
    },
    /// Acknowledges a NewChannelReq.
    NewChannelAns {
        /// Status bits.
        status: u8,
    },
    /// Acknowledges an RXTimingSetupReq.
    RxTimingSetupAns,
    /// Acknowledges a TxParamSetupReq.
    TxParamSetupAns,
    /// Acknowledges a DlChannelReq.
    DlChannelAns {
        /// Status bits.
        status: u8,
    },
    /// Acknowledges an ADRParamSetupReq.
    AdrParamSetupAns,
    /// Device asks for network time.
    DeviceTimeReq,
    /// Class B device announces its ping-slot periodicity.
    PingSlotInfoReq {
        /// Periodicity exponent (0..=7).
        periodicity: u8,
    },

    // =========== Network → device ===========
    /// Answer to LinkCheckReq.
    LinkCheckAns {
        /// Demodulation margin in dB.
        margin: u8,
        /// Number of gateways that received the request.
        gateway_count: u8,
    },
    /// Data rate, power and channel mask update.
    LinkAdrReq {
        /// Data rate index.
        data_rate: u8,
        /// TX power index.
        tx_power: u8,
        /// Channel enable mask.
        ch_mask: u16,
        /// Channel mask control and NbTrans, packed as on the wire.
        redundancy: u8,
    },
    /// Aggregated duty cycle limit `1 / 2^max_duty_cycle`.
    DutyCycleReq {
        /// Exponent.
        max_duty_cycle: u8,
    },
    /// RX1 offset / RX2 data rate and frequency.
    RxParamSetupReq {
        /// RX1DROffset and RX2DataRate.
        dl_settings: u8,
        /// RX2 frequency in Hz.
        frequency_hz: u32,
    },
    /// Request for a DevStatusAns.
    DevStatusReq,
    /// Create or modify a channel.
    NewChannelReq {
        /// Channel index.
        ch_index: u8,
        /// Frequency in Hz.
        frequency_hz: u32,
        /// Max DR (high nibble) and min DR (low nibble).
        dr_range: u8,
    },
    /// RX1 delay in seconds (0 means 1).
    RxTimingSetupReq {
        /// Delay in seconds.
        delay: u8,
    },
    /// Dwell time and max EIRP.
    TxParamSetupReq {
        /// Packed settings byte.
        settings: u8,
    },
    /// Downlink frequency of an uplink channel.
    DlChannelReq {
        /// Channel index.
        ch_index: u8,
        /// Frequency in Hz.
        frequency_hz: u32,
    },
    /// ADR_ACK_LIMIT and ADR_ACK_DELAY as powers of two.
    AdrParamSetupReq {
        /// `ADR_ACK_LIMIT = 2^limit_exp`.
        limit_exp: u8,
        /// `ADR_ACK_DELAY = 2^delay_exp`.
        delay_exp: u8,
    },
    /// GPS epoch seconds and fractional part in 1/256 s.
    DeviceTimeAns {
        /// Seconds.
        seconds: u32,
        /// Fraction.
        fraction: u8,
    },
    /// Acknowledges a PingSlotInfoReq.
    PingSlotInfoAns,
}

impl MacCommand {
    /// Command identifier on the wire.
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => cid::LINK_CHECK,
            MacCommand::LinkAdrReq { .. } | MacCommand::LinkAdrAns { .. } => cid::LINK_ADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => cid::DUTY_CYCLE,
            MacCommand::RxParamSetupReq { .. } | MacCommand::RxParamSetupAns { .. } => {
                cid::RX_PARAM_SETUP
            }
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => cid::DEV_STATUS,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => cid::NEW_CHANNEL,
            MacCommand::RxTimingSetupReq { .. } | MacCommand::RxTimingSetupAns => {
                cid::RX_TIMING_SETUP
            }
            MacCommand::TxParamSetupReq { .. } | MacCommand::TxParamSetupAns => cid::TX_PARAM_SETUP,
            MacCommand::DlChannelReq { .. } | MacCommand::DlChannelAns { .. } => cid::DL_CHANNEL,
            MacCommand::AdrParamSetupReq { .. } | MacCommand::AdrParamSetupAns => cid::ADR_PARAM_SETUP,
            MacCommand::DeviceTimeReq | MacCommand::DeviceTimeAns { .. } => cid::DEVICE_TIME,
            MacCommand::PingSlotInfoReq { .. } | MacCommand::PingSlotInfoAns => cid::PING_SLOT_INFO,
        }
    }

    /// Direction the command travels in.
    pub fn direction(&self) -> Direction {
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::LinkAdrAns { .. }
            | MacCommand::DutyCycleAns
            | MacCommand::RxParamSetupAns { .. }
            | MacCommand::DevStatusAns { .. }
            | MacCommand::NewChannelAns { .. }
            | MacCommand::RxTimingSetupAns
            | MacCommand::TxParamSetupAns
            | MacCommand::DlChannelAns { .. }
            | MacCommand::AdrParamSetupAns
            | MacCommand::DeviceTimeReq
            | MacCommand::PingSlotInfoReq { .. } => Direction::Up,
            _ => Direction::Down,
        }
    }

    /// Label for metrics and logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MacCommand::LinkCheckReq => "link_check_req",
            MacCommand::LinkCheckAns { .. } => "link_check_ans",
            MacCommand::LinkAdrReq { .. } => "link_adr_req",
            MacCommand::LinkAdrAns { .. } => "link_adr_ans",
            MacCommand::DutyCycleReq { .. } => "duty_cycle_req",
            MacCommand::DutyCycleAns => "duty_cycle_ans",
            MacCommand::RxParamSetupReq { .. } => "rx_param_setup_req",
            MacCommand::RxParamSetupAns { .. } => "rx_param_setup_ans",
            MacCommand::DevStatusReq => "dev_status_req",
            MacCommand::DevStatusAns { .. } => "dev_status_ans",
            MacCommand::NewChannelReq { .. } => "new_channel_req",
            MacCommand::NewChannelAns { .. } => "new_channel_ans",
            MacCommand::RxTimingSetupReq { .. } => "rx_timing_setup_req",
            MacCommand::RxTimingSetupAns => "rx_timing_setup_ans",
            MacCommand::TxParamSetupReq { .. } => "tx_param_setup_req",
            MacCommand::TxParamSetupAns => "tx_param_setup_ans",
            MacCommand::DlChannelReq { .. } => "dl_channel_req",
            MacCommand::DlChannelAns { .. } => "dl_channel_ans",
            MacCommand::AdrParamSetupReq { .. } => "adr_param_setup_req",
            MacCommand::AdrParamSetupAns => "adr_param_setup_ans",
            MacCommand::DeviceTimeReq => "device_time_req",
            MacCommand::DeviceTimeAns { .. } => "device_time_ans",
            MacCommand::PingSlotInfoReq { .. } => "ping_slot_info_req",
            MacCommand::PingSlotInfoAns => "ping_slot_info_ans",
        }
    }

    /// Pack data rate and power into a LinkADRReq with the given NbTrans.
    pub fn link_adr_req(data_rate: u8, tx_power: u8, ch_mask: u16, nb_trans: u8) -> Self {
        MacCommand::LinkAdrReq {
            data_rate,
            tx_power,
            ch_mask,
            redundancy: nb_trans & 0x0F,
        }
    }

    /// Append the wire encoding (CID + payload) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.cid());
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::RxTimingSetupAns
            | MacCommand::TxParamSetupAns
            | MacCommand::AdrParamSetupAns
            | MacCommand::DeviceTimeReq
            | MacCommand::DevStatusReq
            | MacCommand::PingSlotInfoAns => {}
            MacCommand::LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                let status = (*power_ack as u8) << 2
                    | (*data_rate_ack as u8) << 1
                    | (*channel_mask_ack as u8);
                out.push(status);
            }
            MacCommand::RxParamSetupAns { status }
            | MacCommand::NewChannelAns { status }
            | MacCommand::DlChannelAns { status } => out.push(*status),
            MacCommand::DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push((*margin as u8) & 0x3F);
            }
            MacCommand::PingSlotInfoReq { periodicity } => out.push(periodicity & 0x07),
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => {
                out.push(*margin);
                out.push(*gateway_count);
            }
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                ch_mask,
                redundancy,
            } => {
                out.push((data_rate & 0x0F) << 4 | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push(*redundancy);
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => out.push(max_duty_cycle & 0x0F),
            MacCommand::RxParamSetupReq {
                dl_settings,
                frequency_hz,
            } => {
                out.push(*dl_settings);
                push_freq(out, *frequency_hz);
            }
            MacCommand::NewChannelReq {
                ch_index,
                frequency_hz,
                dr_range,
            } => {
                out.push(*ch_index);
                push_freq(out, *frequency_hz);
                out.push(*dr_range);
            }
            MacCommand::RxTimingSetupReq { delay } => out.push(delay & 0x0F),
            MacCommand::TxParamSetupReq { settings } => out.push(*settings),
            MacCommand::AdrParamSetupReq { limit_exp, delay_exp } => {
                out.push((limit_exp & 0x0F) << 4 | (delay_exp & 0x0F));
            }
            MacCommand::DlChannelReq {
                ch_index,
                frequency_hz,
            } => {
                out.push(*ch_index);
                push_freq(out, *frequency_hz);
            }
            MacCommand::DeviceTimeAns { seconds, fraction } => {
                out.extend_from_slice(&seconds.to_le_bytes());
                out.push(*fraction);
            }
        }
    }
}

fn push_freq(out: &mut Vec<u8>, frequency_hz: u32) {
    let units = frequency_hz / 100;
    out.extend_from_slice(&units.to_le_bytes()[..3]);
}

fn read_freq(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}

/// Payload length (after the CID) of a command in the given direction.
fn payload_len(cid: u8, dir: Direction) -> Result<usize, PacketError> {
    let len = match (dir, cid) {
        (Direction::Up, cid::LINK_CHECK) => 0,
        (Direction::Up, cid::LINK_ADR) => 1,
        (Direction::Up, cid::DUTY_CYCLE) => 0,
        (Direction::Up, cid::RX_PARAM_SETUP) => 1,
        (Direction::Up, cid::DEV_STATUS) => 2,
        (Direction::Up, cid::NEW_CHANNEL) => 1,
        (Direction::Up, cid::RX_TIMING_SETUP) => 0,
        (Direction::Up, cid::TX_PARAM_SETUP) => 0,
        (Direction::Up, cid::DL_CHANNEL) => 1,
        (Direction::Up, cid::ADR_PARAM_SETUP) => 0,
        (Direction::Up, cid::DEVICE_TIME) => 0,
        (Direction::Up, cid::PING_SLOT_INFO) => 1,
        (Direction::Down, cid::LINK_CHECK) => 2,
        (Direction::Down, cid::LINK_ADR) => 4,
        (Direction::Down, cid::DUTY_CYCLE) => 1,
        (Direction::Down, cid::RX_PARAM_SETUP) => 4,
        (Direction::Down, cid::DEV_STATUS) => 0,
        (Direction::Down, cid::NEW_CHANNEL) => 5,
        (Direction::Down, cid::RX_TIMING_SETUP) => 1,
        (Direction::Down, cid::TX_PARAM_SETUP) => 1,
        (Direction::Down, cid::DL_CHANNEL) => 4,
        (Direction::Down, cid::ADR_PARAM_SETUP) => 1,
        (Direction::Down, cid::DEVICE_TIME) => 5,
        (Direction::Down, cid::PING_SLOT_INFO) => 0,
        (_, other) => return Err(PacketError::UnknownMacCommand(other)),
    };
    Ok(len)
}

/// Encode a list of commands back to back.
pub fn encode_commands(commands: &[MacCommand]) -> Vec<u8> {
    let mut out = Vec::new();
    for command in commands {
        command.encode_into(&mut out);
    }
    out
}

/// Total encoded size of a list of commands.
pub fn encoded_len(commands: &[MacCommand]) -> usize {
    encode_commands(commands).len()
}

/// Decode a sequence of commands travelling in `dir`.
pub fn decode_commands(bytes: &[u8], dir: Direction) -> Result<Vec<MacCommand>, PacketError> {
    let mut commands = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let cid = bytes[pos];
        let needed = payload_len(cid, dir)?;
        let rest = &bytes[pos + 1..];
        if rest.len() < needed {
            return Err(PacketError::TruncatedMacCommand {
                cid,
                needed,
                actual: rest.len(),
            });
        }
        let p = &rest[..needed];

        let command = match (dir, cid) {
            (Direction::Up, cid::LINK_CHECK) => MacCommand::LinkCheckReq,
            (Direction::Up, cid::LINK_ADR) => MacCommand::LinkAdrAns {
                power_ack: p[0] & 0x04 != 0,
                data_rate_ack: p[0] & 0x02 != 0,
                channel_mask_ack: p[0] & 0x01 != 0,
            },
            (Direction::Up, cid::DUTY_CYCLE) => MacCommand::DutyCycleAns,
            (Direction::Up, cid::RX_PARAM_SETUP) => MacCommand::RxParamSetupAns { status: p[0] },
            (Direction::Up, cid::DEV_STATUS) => {
                // 6-bit two's complement
                let raw = p[1] & 0x3F;
                let margin = if raw & 0x20 != 0 {
                    (raw | 0xC0) as i8
                } else {
                    raw as i8
                };
                MacCommand::DevStatusAns {
                    battery: p[0],
                    margin,
                }
            }
            (Direction::Up, cid::NEW_CHANNEL) => MacCommand::NewChannelAns { status: p[0] },
            (Direction::Up, cid::RX_TIMING_SETUP) => MacCommand::RxTimingSetupAns,
            (Direction::Up, cid::TX_PARAM_SETUP) => MacCommand::TxParamSetupAns,
            (Direction::Up, cid::DL_CHANNEL) => MacCommand::DlChannelAns { status: p[0] },
            (Direction::Up, cid::ADR_PARAM_SETUP) => MacCommand::AdrParamSetupAns,
            (Direction::Up, cid::DEVICE_TIME) => MacCommand::DeviceTimeReq,
            (Direction::Up, cid::PING_SLOT_INFO) => MacCommand::PingSlotInfoReq {
                periodicity: p[0] & 0x07,
            },
            (Direction::Down, cid::LINK_CHECK) => MacCommand::LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            (Direction::Down, cid::LINK_ADR) => MacCommand::LinkAdrReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0F,
                ch_mask: u16::from_le_bytes([p[1], p[2]]),
                redundancy: p[3],
            },
            (Direction::Down, cid::DUTY_CYCLE) => MacCommand::DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            (Direction::Down, cid::RX_PARAM_SETUP) => MacCommand::RxParamSetupReq {
                dl_settings: p[0],
                frequency_hz: read_freq(&p[1..4]),
            },
            (Direction::Down, cid::DEV_STATUS) => MacCommand::DevStatusReq,
            (Direction::Down, cid::NEW_CHANNEL) => MacCommand::NewChannelReq {
                ch_index: p[0],
                frequency_hz: read_freq(&p[1..4]),
                dr_range: p[4],
            },
            (Direction::Down, cid::RX_TIMING_SETUP) => MacCommand::RxTimingSetupReq {
                delay: p[0] & 0x0F,
            },
            (Direction::Down, cid::TX_PARAM_SETUP) => MacCommand::TxParamSetupReq { settings: p[0] },
            (Direction::Down, cid::DL_CHANNEL) => MacCommand::DlChannelReq {
                ch_index: p[0],
                frequency_hz: read_freq(&p[1..4]),
            },
            (Direction::Down, cid::ADR_PARAM_SETUP) => MacCommand::AdrParamSetupReq {
                limit_exp: p[0] >> 4,
                delay_exp: p[0] & 0x0F,
            },
            (Direction::Down, cid::DEVICE_TIME) => MacCommand::DeviceTimeAns {
                seconds: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                fraction: p[4],
            },
            (Direction::Down, cid::PING_SLOT_INFO) => MacCommand::PingSlotInfoAns,
            (_, other) => return Err(PacketError::UnknownMacCommand(other)),
        };

        commands.push(command);
        pos += 1 + needed;
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_adr_req_wire_layout() {
        let cmd = MacCommand::link_adr_req(5, 2, 0x0007, 1);
        let bytes = encode_commands(&[cmd.clone()]);
        assert_eq!(bytes, vec![0x03, 0x52, 0x07, 0x00, 0x01]);
        assert_eq!(decode_commands(&bytes, Direction::Down).unwrap(), vec![cmd]);
    }

    #[test]
    fn test_uplink_answers_decode() {
        let cmds = vec![
            MacCommand::LinkAdrAns {
                power_ack: true,
                data_rate_ack: true,
                channel_mask_ack: true,
            },
            MacCommand::DevStatusAns {
                battery: 200,
                margin: -5,
            },
            MacCommand::LinkCheckReq,
        ];
        let bytes = encode_commands(&cmds);
        assert_eq!(bytes[0..2], [0x03, 0x07]);
        assert_eq!(decode_commands(&bytes, Direction::Up).unwrap(), cmds);
    }

    #[test]
    fn test_same_cid_depends_on_direction() {
        let bytes = [0x02, 20, 3];
        let down = decode_commands(&bytes, Direction::Down).unwrap();
        assert_eq!(
            down,
            vec![MacCommand::LinkCheckAns {
                margin: 20,
                gateway_count: 3
            }]
        );
        // Uplink 0x02 has no payload, so the trailing bytes are read as commands.
        assert!(decode_commands(&bytes, Direction::Up).is_err());
    }

    #[test]
    fn test_truncated_command_rejected() {
        let err = decode_commands(&[0x03, 0x52, 0x07], Direction::Down).unwrap_err();
        assert_eq!(
            err,
            PacketError::TruncatedMacCommand {
                cid: 0x03,
                needed: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_adr_param_setup_packs_exponents() {
        let req = MacCommand::AdrParamSetupReq {
            limit_exp: 3,
            delay_exp: 2,
        };
        let bytes = encode_commands(&[req.clone()]);
        assert_eq!(bytes, vec![0x0C, 0x32]);
        assert_eq!(decode_commands(&bytes, Direction::Down).unwrap(), vec![req]);
        // the answer carries no payload
        assert_eq!(
            decode_commands(&[0x0C, 0x02], Direction::Up).unwrap(),
            vec![MacCommand::AdrParamSetupAns, MacCommand::LinkCheckReq]
        );
    }

    #[test]
    fn test_frequency_encoding_in_100hz_units() {
        let cmd = MacCommand::NewChannelReq {
            ch_index: 3,
            frequency_hz: 867_100_000,
            dr_range: 0x50,
        };
        let bytes = encode_commands(&[cmd.clone()]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode_commands(&bytes, Direction::Down).unwrap(), vec![cmd]);
    }
}
