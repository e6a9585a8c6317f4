//! # lorawan-packet
//!
//! LoRaWAN 1.0.x frame encoding, decoding and security.
//!
//! This crate provides the PHYPayload types exchanged between simulated
//! devices and the network server:
//! - Data frames ([`DataFrame`]) with FHDR, FOpts, FPort, FRMPayload and MIC
//! - Join procedure frames ([`JoinRequest`], [`JoinAccept`])
//! - MAC commands ([`mac::MacCommand`])
//! - Cryptographic primitives ([`crypto`])
//! - Regional tables ([`region`])
//!
//! ## Frame Structure
//!
//! ```text
//! MHDR(1) | DevAddr(4) | FCtrl(1) | FCnt(2) | FOpts(0..15) | FPort(0..1) | FRMPayload | MIC(4)
//! ```
//!
//! All multi-byte fields are little endian on the wire.

pub mod crypto;
pub mod error;
pub mod mac;
pub mod region;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::{PacketError, SecurityError};
pub use mac::MacCommand;
pub use region::Region;

// ============================================================================
// Constants
// ============================================================================

/// Maximum PHYPayload size in bytes.
pub const MAX_PHY_PAYLOAD: usize = 255;

/// Maximum FOpts size in bytes.
pub const MAX_FOPTS: usize = 15;

/// MHDR + DevAddr + FCtrl + FCnt + MIC.
const MIN_DATA_FRAME: usize = 12;

/// MHDR + JoinEUI + DevEUI + DevNonce + MIC.
const JOIN_REQUEST_LEN: usize = 23;

/// MHDR + 16 encrypted bytes (no CFList).
const JOIN_ACCEPT_LEN: usize = 17;

// ============================================================================
// Identifiers and Keys
// ============================================================================

/// Frame direction, as used in the B0 and A blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Device to network.
    Up = 0,
    /// Network to device.
    Down = 1,
}

/// 32-bit device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Wire (little endian) representation.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Parse from wire bytes.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        DevAddr(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// 64-bit extended unique identifier (DevEUI / JoinEUI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Eui64(pub u64);

impl Eui64 {
    /// Parse a 16 hex digit, big-endian string such as `"70B3D57ED0000001"`.
    pub fn from_hex(s: &str) -> Result<Self, PacketError> {
        let bytes = hex::decode(s).map_err(|e| PacketError::InvalidHex {
            field: "eui64",
            reason: e.to_string(),
        })?;
        let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| PacketError::InvalidHex {
            field: "eui64",
            reason: format!("expected 8 bytes, got {}", bytes.len()),
        })?;
        Ok(Eui64(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// AES-128 key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AesKey([u8; 16]);

impl AesKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        AesKey(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse a 32 hex digit string.
    pub fn from_hex(s: &str) -> Result<Self, PacketError> {
        let bytes = hex::decode(s).map_err(|e| PacketError::InvalidHex {
            field: "aes key",
            reason: e.to_string(),
        })?;
        let arr: [u8; 16] = bytes.as_slice().try_into().map_err(|_| PacketError::InvalidHex {
            field: "aes key",
            reason: format!("expected 16 bytes, got {}", bytes.len()),
        })?;
        Ok(AesKey(arr))
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys stay out of logs.
        write!(f, "AesKey(..)")
    }
}

/// Session keys of an activated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Network session key (MIC, FPort 0 payloads).
    pub nwk_skey: AesKey,
    /// Application session key (FPort > 0 payloads).
    pub app_skey: AesKey,
}

/// Rebuild a 32-bit frame counter from the 16 bits carried on the wire.
///
/// `last` is the last accepted 32-bit counter.
pub fn extend_fcnt(last: u32, wire: u16) -> u32 {
    let candidate = (last & 0xFFFF_0000) | wire as u32;
    if candidate < last {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}

// ============================================================================
// Header Types
// ============================================================================

/// Message type (MHDR bits 5-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MType {
    /// Join request.
    JoinRequest = 0,
    /// Join accept.
    JoinAccept = 1,
    /// Unconfirmed data uplink.
    UnconfirmedDataUp = 2,
    /// Unconfirmed data downlink.
    UnconfirmedDataDown = 3,
    /// Confirmed data uplink.
    ConfirmedDataUp = 4,
    /// Confirmed data downlink.
    ConfirmedDataDown = 5,
}

impl MType {
    /// Parse the MHDR byte. Only LoRaWAN R1 (major 0) is accepted.
    pub fn from_mhdr(mhdr: u8) -> Result<Self, PacketError> {
        if mhdr & 0x03 != 0 {
            return Err(PacketError::UnsupportedMhdr(mhdr));
        }
        match mhdr >> 5 {
            0 => Ok(MType::JoinRequest),
            1 => Ok(MType::JoinAccept),
            2 => Ok(MType::UnconfirmedDataUp),
            3 => Ok(MType::UnconfirmedDataDown),
            4 => Ok(MType::ConfirmedDataUp),
            5 => Ok(MType::ConfirmedDataDown),
            _ => Err(PacketError::UnsupportedMhdr(mhdr)),
        }
    }

    /// MHDR byte for this message type.
    pub fn to_mhdr(self) -> u8 {
        (self as u8) << 5
    }

    /// Data message type for a direction.
    pub fn data(direction: Direction, confirmed: bool) -> Self {
        match (direction, confirmed) {
            (Direction::Up, false) => MType::UnconfirmedDataUp,
            (Direction::Up, true) => MType::ConfirmedDataUp,
            (Direction::Down, false) => MType::UnconfirmedDataDown,
            (Direction::Down, true) => MType::ConfirmedDataDown,
        }
    }

    /// Direction of travel.
    pub fn direction(self) -> Direction {
        match self {
            MType::JoinRequest | MType::UnconfirmedDataUp | MType::ConfirmedDataUp => Direction::Up,
            _ => Direction::Down,
        }
    }

    /// True for confirmed data frames.
    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }

    /// Lowercase label for metric breakdowns.
    pub fn as_label(self) -> &'static str {
        match self {
            MType::JoinRequest => "join_request",
            MType::JoinAccept => "join_accept",
            MType::UnconfirmedDataUp => "unconfirmed_up",
            MType::UnconfirmedDataDown => "unconfirmed_down",
            MType::ConfirmedDataUp => "confirmed_up",
            MType::ConfirmedDataDown => "confirmed_down",
        }
    }
}

/// Frame control byte.
///
/// Bit 4 is FPending on downlinks and the Class B flag on uplinks; both map
/// to `f_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FCtrl {
    /// Device runs ADR.
    pub adr: bool,
    /// Device requests a downlink to confirm connectivity (uplink only).
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame.
    pub ack: bool,
    /// More downlink data pending / Class B enabled.
    pub f_pending: bool,
    /// FOpts length (0..=15).
    pub fopts_len: u8,
}

impl FCtrl {
    /// Encode to the wire byte.
    pub fn encode(&self) -> u8 {
        (self.adr as u8) << 7
            | (self.adr_ack_req as u8) << 6
            | (self.ack as u8) << 5
            | (self.f_pending as u8) << 4
            | (self.fopts_len & 0x0F)
    }

    /// Decode from the wire byte.
    pub fn decode(byte: u8) -> Self {
        FCtrl {
            adr: byte & 0x80 != 0,
            adr_ack_req: byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            f_pending: byte & 0x10 != 0,
            fopts_len: byte & 0x0F,
        }
    }
}

// ============================================================================
// Data Frames
// ============================================================================

/// Everything needed to build and seal a data frame.
#[derive(Debug, Clone)]
pub struct FrameParams<'a> {
    /// Uplink or downlink.
    pub direction: Direction,
    /// Confirmed data.
    pub confirmed: bool,
    /// Device address.
    pub dev_addr: DevAddr,
    /// Full 32-bit frame counter (only the low 16 bits go on air).
    pub fcnt: u32,
    /// Control flags; `fopts_len` is filled in when sealing.
    pub fctrl: FCtrl,
    /// Application port. Ignored when there is no application payload.
    pub fport: u8,
    /// Application payload (plaintext).
    pub payload: &'a [u8],
    /// MAC commands to piggyback.
    pub mac_commands: &'a [MacCommand],
}

/// A LoRaWAN data frame as seen on air (FRMPayload encrypted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Message type.
    pub mtype: MType,
    /// Device address.
    pub dev_addr: DevAddr,
    /// Frame control.
    pub fctrl: FCtrl,
    /// Low 16 bits of the frame counter.
    pub fcnt: u16,
    /// Piggybacked MAC commands (cleartext in 1.0.x).
    pub fopts: Vec<u8>,
    /// Port, absent when there is no FRMPayload.
    pub fport: Option<u8>,
    /// Encrypted FRMPayload.
    pub frm_payload: Vec<u8>,
    /// Message integrity code.
    pub mic: [u8; 4],
}

impl DataFrame {
    /// Build, encrypt and MIC a data frame.
    ///
    /// MAC commands go in FOpts when an application payload is present. With
    /// no application payload they travel on FPort 0, encrypted with NwkSKey.
    pub fn seal(params: &FrameParams<'_>, keys: &SessionKeys) -> Result<Self, PacketError> {
        let commands = mac::encode_commands(params.mac_commands);
        let has_payload = !params.payload.is_empty();

        let (fopts, fport, plaintext, key) = if has_payload {
            if commands.len() > MAX_FOPTS {
                return Err(PacketError::FOptsTooLong(commands.len()));
            }
            (commands, Some(params.fport), params.payload.to_vec(), &keys.app_skey)
        } else if !commands.is_empty() {
            (Vec::new(), Some(0), commands, &keys.nwk_skey)
        } else {
            (Vec::new(), None, Vec::new(), &keys.app_skey)
        };

        let frm_payload =
            crypto::crypt_frm_payload(key, params.dev_addr, params.fcnt, params.direction, &plaintext);

        let mut frame = DataFrame {
            mtype: MType::data(params.direction, params.confirmed),
            dev_addr: params.dev_addr,
            fctrl: FCtrl {
                fopts_len: fopts.len() as u8,
                ..params.fctrl
            },
            fcnt: params.fcnt as u16,
            fopts,
            fport,
            frm_payload,
            mic: [0; 4],
        };

        let body = frame.body_bytes();
        if body.len() + 4 > MAX_PHY_PAYLOAD {
            return Err(PacketError::TooLong(body.len() + 4));
        }
        frame.mic = crypto::compute_data_mic(
            &keys.nwk_skey,
            &body,
            params.dev_addr,
            params.fcnt,
            params.direction,
        )?;
        Ok(frame)
    }

    /// Direction of travel.
    pub fn direction(&self) -> Direction {
        self.mtype.direction()
    }

    /// MHDR through FRMPayload; the MIC input.
    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_DATA_FRAME + self.fopts.len() + self.frm_payload.len());
        out.push(self.mtype.to_mhdr());
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.fctrl.encode());
        out.extend_from_slice(&self.fcnt.to_le_bytes());
        out.extend_from_slice(&self.fopts);
        if let Some(port) = self.fport {
            out.push(port);
            out.extend_from_slice(&self.frm_payload);
        }
        out
    }

    /// Serialize to PHYPayload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        out.extend_from_slice(&self.mic);
        out
    }

    fn decode_body(mtype: MType, data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_DATA_FRAME {
            return Err(PacketError::TooShort {
                needed: MIN_DATA_FRAME,
                actual: data.len(),
            });
        }
        let dev_addr = DevAddr::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let fctrl = FCtrl::decode(data[5]);
        let fcnt = u16::from_le_bytes([data[6], data[7]]);
        let mic_start = data.len() - 4;
        let fopts_end = 8 + fctrl.fopts_len as usize;
        if fopts_end > mic_start {
            return Err(PacketError::TooShort {
                needed: fopts_end + 4,
                actual: data.len(),
            });
        }
        let fopts = data[8..fopts_end].to_vec();
        let (fport, frm_payload) = if fopts_end < mic_start {
            (Some(data[fopts_end]), data[fopts_end + 1..mic_start].to_vec())
        } else {
            (None, Vec::new())
        };
        let mut mic = [0u8; 4];
        mic.copy_from_slice(&data[mic_start..]);

        Ok(DataFrame {
            mtype,
            dev_addr,
            fctrl,
            fcnt,
            fopts,
            fport,
            frm_payload,
            mic,
        })
    }

    /// Verify the MIC with the 32-bit counter reconstructed by the receiver.
    pub fn verify_mic(&self, nwk_skey: &AesKey, fcnt32: u32) -> Result<(), SecurityError> {
        let expected = crypto::compute_data_mic(
            nwk_skey,
            &self.body_bytes(),
            self.dev_addr,
            fcnt32,
            self.direction(),
        )?;
        if expected == self.mic {
            Ok(())
        } else {
            Err(SecurityError::MicMismatch {
                context: format!("DevAddr {}", self.dev_addr),
            })
        }
    }

    /// Decrypt the FRMPayload. FPort 0 uses NwkSKey, other ports AppSKey.
    pub fn decrypt_payload(&self, keys: &SessionKeys, fcnt32: u32) -> Vec<u8> {
        let key = match self.fport {
            Some(0) => &keys.nwk_skey,
            _ => &keys.app_skey,
        };
        crypto::crypt_frm_payload(key, self.dev_addr, fcnt32, self.direction(), &self.frm_payload)
    }

    /// MAC commands carried in FOpts or on FPort 0.
    pub fn mac_commands(&self, keys: &SessionKeys, fcnt32: u32) -> Result<Vec<MacCommand>, PacketError> {
        let dir = self.direction();
        let mut commands = mac::decode_commands(&self.fopts, dir)?;
        if self.fport == Some(0) {
            commands.extend(mac::decode_commands(&self.decrypt_payload(keys, fcnt32), dir)?);
        }
        Ok(commands)
    }

    /// Application payload (empty for FPort 0 or no payload).
    pub fn application_payload(&self, keys: &SessionKeys, fcnt32: u32) -> Vec<u8> {
        match self.fport {
            Some(port) if port > 0 => self.decrypt_payload(keys, fcnt32),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Join Frames
// ============================================================================

/// OTAA join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Join server / application EUI.
    pub join_eui: Eui64,
    /// Device EUI.
    pub dev_eui: Eui64,
    /// Device nonce; must increase for each request.
    pub dev_nonce: u16,
    /// MIC under AppKey.
    pub mic: [u8; 4],
}

impl JoinRequest {
    /// Build and MIC a join request.
    pub fn seal(join_eui: Eui64, dev_eui: Eui64, dev_nonce: u16, app_key: &AesKey) -> Result<Self, SecurityError> {
        let mut req = JoinRequest {
            join_eui,
            dev_eui,
            dev_nonce,
            mic: [0; 4],
        };
        req.mic = crypto::compute_join_request_mic(app_key, &req.body_bytes())?;
        Ok(req)
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JOIN_REQUEST_LEN);
        out.push(MType::JoinRequest.to_mhdr());
        out.extend_from_slice(&self.join_eui.0.to_le_bytes());
        out.extend_from_slice(&self.dev_eui.0.to_le_bytes());
        out.extend_from_slice(&self.dev_nonce.to_le_bytes());
        out
    }

    /// Serialize to PHYPayload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        out.extend_from_slice(&self.mic);
        out
    }

    fn decode_body(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() != JOIN_REQUEST_LEN {
            return Err(PacketError::TooShort {
                needed: JOIN_REQUEST_LEN,
                actual: data.len(),
            });
        }
        let mut eui = [0u8; 8];
        eui.copy_from_slice(&data[1..9]);
        let join_eui = Eui64(u64::from_le_bytes(eui));
        eui.copy_from_slice(&data[9..17]);
        let dev_eui = Eui64(u64::from_le_bytes(eui));
        let dev_nonce = u16::from_le_bytes([data[17], data[18]]);
        let mut mic = [0u8; 4];
        mic.copy_from_slice(&data[19..23]);
        Ok(JoinRequest {
            join_eui,
            dev_eui,
            dev_nonce,
            mic,
        })
    }

    /// Verify the MIC against the device root key.
    pub fn verify_mic(&self, app_key: &AesKey) -> Result<(), SecurityError> {
        let expected = crypto::compute_join_request_mic(app_key, &self.body_bytes())?;
        if expected == self.mic {
            Ok(())
        } else {
            Err(SecurityError::MicMismatch {
                context: format!("DevEUI {}", self.dev_eui),
            })
        }
    }
}

/// Cleartext join accept fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAccept {
    /// Server nonce (24 bits).
    pub app_nonce: u32,
    /// Network identifier (24 bits).
    pub net_id: u32,
    /// Assigned device address.
    pub dev_addr: DevAddr,
    /// RX1DROffset (bits 4-6) and RX2 data rate (bits 0-3).
    pub dl_settings: u8,
    /// RX1 delay in seconds (0 means 1).
    pub rx_delay: u8,
}

impl JoinAccept {
    fn fields(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..3].copy_from_slice(&self.app_nonce.to_le_bytes()[..3]);
        out[3..6].copy_from_slice(&self.net_id.to_le_bytes()[..3]);
        out[6..10].copy_from_slice(&self.dev_addr.to_le_bytes());
        out[10] = self.dl_settings;
        out[11] = self.rx_delay;
        out
    }

    /// MIC and encrypt under AppKey, returning the PHYPayload bytes.
    pub fn seal(&self, app_key: &AesKey) -> Result<Vec<u8>, SecurityError> {
        let mhdr = MType::JoinAccept.to_mhdr();
        let fields = self.fields();
        let mut msg = Vec::with_capacity(13);
        msg.push(mhdr);
        msg.extend_from_slice(&fields);
        let mic = crypto::compute_join_accept_mic(app_key, &msg)?;

        let mut plain = fields.to_vec();
        plain.extend_from_slice(&mic);
        let encrypted = crypto::encrypt_join_accept(app_key, &plain)?;

        let mut out = Vec::with_capacity(JOIN_ACCEPT_LEN);
        out.push(mhdr);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    /// Decrypt and verify a join accept PHYPayload.
    pub fn open(phy: &[u8], app_key: &AesKey) -> Result<Self, SecurityError> {
        if phy.len() != JOIN_ACCEPT_LEN {
            return Err(SecurityError::DecryptionFailed(format!(
                "join accept must be {} bytes, got {}",
                JOIN_ACCEPT_LEN,
                phy.len()
            )));
        }
        let plain = crypto::decrypt_join_accept(app_key, &phy[1..])?;
        let mut msg = Vec::with_capacity(13);
        msg.push(phy[0]);
        msg.extend_from_slice(&plain[..12]);
        let expected = crypto::compute_join_accept_mic(app_key, &msg)?;
        if expected[..] != plain[12..16] {
            return Err(SecurityError::MicMismatch {
                context: "join accept".to_string(),
            });
        }
        Ok(JoinAccept {
            app_nonce: u32::from_le_bytes([plain[0], plain[1], plain[2], 0]),
            net_id: u32::from_le_bytes([plain[3], plain[4], plain[5], 0]),
            dev_addr: DevAddr::from_le_bytes([plain[6], plain[7], plain[8], plain[9]]),
            dl_settings: plain[10],
            rx_delay: plain[11],
        })
    }
}

// ============================================================================
// PHYPayload
// ============================================================================

/// Any frame that can appear on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyPayload {
    /// Join request (cleartext).
    JoinRequest(JoinRequest),
    /// Join accept, still encrypted; open with [`JoinAccept::open`].
    JoinAccept(Vec<u8>),
    /// Data frame.
    Data(DataFrame),
}

impl PhyPayload {
    /// Decode PHYPayload bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::TooShort { needed: 1, actual: 0 });
        }
        if data.len() > MAX_PHY_PAYLOAD {
            return Err(PacketError::TooLong(data.len()));
        }
        match MType::from_mhdr(data[0])? {
            MType::JoinRequest => Ok(PhyPayload::JoinRequest(JoinRequest::decode_body(data)?)),
            MType::JoinAccept => {
                if data.len() != JOIN_ACCEPT_LEN {
                    return Err(PacketError::TooShort {
                        needed: JOIN_ACCEPT_LEN,
                        actual: data.len(),
                    });
                }
                Ok(PhyPayload::JoinAccept(data.to_vec()))
            }
            mtype => Ok(PhyPayload::Data(DataFrame::decode_body(mtype, data)?)),
        }
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PhyPayload::JoinRequest(req) => req.encode(),
            PhyPayload::JoinAccept(bytes) => bytes.clone(),
            PhyPayload::Data(frame) => frame.encode(),
        }
    }

    /// Message type.
    pub fn mtype(&self) -> MType {
        match self {
            PhyPayload::JoinRequest(_) => MType::JoinRequest,
            PhyPayload::JoinAccept(_) => MType::JoinAccept,
            PhyPayload::Data(frame) => frame.mtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys {
            nwk_skey: AesKey::new([0x2B; 16]),
            app_skey: AesKey::new([0x3C; 16]),
        }
    }

    fn uplink<'a>(payload: &'a [u8], commands: &'a [MacCommand]) -> FrameParams<'a> {
        FrameParams {
            direction: Direction::Up,
            confirmed: false,
            dev_addr: DevAddr(0x2601_1BDA),
            fcnt: 0x0001_0005,
            fctrl: FCtrl {
                adr: true,
                ..Default::default()
            },
            fport: 10,
            payload,
            mac_commands: commands,
        }
    }

    #[test]
    fn test_mhdr_roundtrip() {
        for mtype in [
            MType::JoinRequest,
            MType::JoinAccept,
            MType::UnconfirmedDataUp,
            MType::UnconfirmedDataDown,
            MType::ConfirmedDataUp,
            MType::ConfirmedDataDown,
        ] {
            assert_eq!(MType::from_mhdr(mtype.to_mhdr()).unwrap(), mtype);
        }
        assert_eq!(MType::UnconfirmedDataUp.to_mhdr(), 0x40);
        assert_eq!(MType::ConfirmedDataDown.to_mhdr(), 0xA0);
        assert!(MType::from_mhdr(0xE0).is_err());
        assert!(MType::from_mhdr(0x41).is_err());
    }

    #[test]
    fn test_fctrl_bits() {
        let fctrl = FCtrl {
            adr: true,
            adr_ack_req: true,
            ack: false,
            f_pending: true,
            fopts_len: 3,
        };
        assert_eq!(fctrl.encode(), 0xD3);
        assert_eq!(FCtrl::decode(0xD3), fctrl);
    }

    #[test]
    fn test_data_frame_seal_decode_open() {
        let keys = keys();
        let commands = [MacCommand::LinkCheckReq];
        let frame = DataFrame::seal(&uplink(b"hello", &commands), &keys).unwrap();
        let bytes = frame.encode();

        let decoded = match PhyPayload::decode(&bytes).unwrap() {
            PhyPayload::Data(f) => f,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(decoded, frame);
        assert_eq!(decoded.fcnt, 0x0005);
        let fcnt32 = extend_fcnt(0x0001_0000, decoded.fcnt);
        decoded.verify_mic(&keys.nwk_skey, fcnt32).unwrap();
        assert_eq!(decoded.application_payload(&keys, fcnt32), b"hello".to_vec());
        assert_eq!(decoded.mac_commands(&keys, fcnt32).unwrap(), commands.to_vec());
    }

    #[test]
    fn test_mic_rejects_every_single_bit_mutation() {
        let keys = keys();
        let frame = DataFrame::seal(&uplink(b"payload", &[]), &keys).unwrap();
        let bytes = frame.encode();
        let body_len = bytes.len() - 4;
        for byte in 1..body_len {
            for bit in 0..8 {
                let mut mutated = bytes.clone();
                mutated[byte] ^= 1 << bit;
                let Ok(PhyPayload::Data(f)) = PhyPayload::decode(&mutated) else {
                    continue;
                };
                assert!(
                    f.verify_mic(&keys.nwk_skey, 0x0001_0005).is_err(),
                    "mutation at byte {} bit {} passed",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let keys = keys();
        let frame = DataFrame::seal(&uplink(b"x", &[]), &keys).unwrap();
        let other = AesKey::new([0u8; 16]);
        assert!(matches!(
            frame.verify_mic(&other, 0x0001_0005),
            Err(SecurityError::MicMismatch { .. })
        ));
    }

    #[test]
    fn test_mac_only_frame_uses_port_zero() {
        let keys = keys();
        let commands = [MacCommand::link_adr_req(3, 1, 0x0007, 1)];
        let params = FrameParams {
            direction: Direction::Down,
            payload: &[],
            mac_commands: &commands,
            ..uplink(&[], &[])
        };
        let frame = DataFrame::seal(&params, &keys).unwrap();
        assert_eq!(frame.fport, Some(0));
        assert!(frame.fopts.is_empty());
        assert_eq!(frame.mac_commands(&keys, params.fcnt).unwrap(), commands.to_vec());
        assert!(frame.application_payload(&keys, params.fcnt).is_empty());
    }

    #[test]
    fn test_empty_frame_has_no_port() {
        let frame = DataFrame::seal(&uplink(&[], &[]), &keys()).unwrap();
        assert_eq!(frame.fport, None);
        assert_eq!(frame.encode().len(), 12);
    }

    #[test]
    fn test_join_request_roundtrip_and_mic() {
        let app_key = AesKey::new([0x55; 16]);
        let req = JoinRequest::seal(Eui64(0x70B3_D57E_D000_0001), Eui64(0x0004_A30B_001C_0530), 7, &app_key)
            .unwrap();
        let bytes = req.encode();
        assert_eq!(bytes.len(), 23);
        assert_eq!(bytes[0], 0x00);
        let PhyPayload::JoinRequest(decoded) = PhyPayload::decode(&bytes).unwrap() else {
            panic!("not a join request");
        };
        assert_eq!(decoded, req);
        decoded.verify_mic(&app_key).unwrap();
        assert!(decoded.verify_mic(&AesKey::new([0x56; 16])).is_err());
    }

    #[test]
    fn test_join_accept_seal_open() {
        let app_key = AesKey::new([0x99; 16]);
        let accept = JoinAccept {
            app_nonce: 0x00AB_CDEF,
            net_id: 0x13,
            dev_addr: DevAddr(0x2600_0001),
            dl_settings: 0,
            rx_delay: 1,
        };
        let bytes = accept.seal(&app_key).unwrap();
        assert_eq!(bytes[0], 0x20);
        assert_eq!(bytes.len(), 17);
        assert_eq!(JoinAccept::open(&bytes, &app_key).unwrap(), accept);
        assert!(JoinAccept::open(&bytes, &AesKey::new([0x98; 16])).is_err());
    }

    #[test]
    fn test_extend_fcnt() {
        assert_eq!(extend_fcnt(0, 5), 5);
        assert_eq!(extend_fcnt(0xFFFE, 0x0002), 0x1_0002);
        assert_eq!(extend_fcnt(0x1_0002, 0x0003), 0x1_0003);
        assert_eq!(extend_fcnt(10, 10), 10);
    }

    #[test]
    fn test_eui_and_key_hex() {
        assert_eq!(Eui64::from_hex("70B3D57ED0000001").unwrap(), Eui64(0x70B3_D57E_D000_0001));
        assert!(Eui64::from_hex("70B3").is_err());
        assert!(AesKey::from_hex("zz").is_err());
        let k = AesKey::from_hex("2B7E151628AED2A6ABF7158809CF4F3C").unwrap();
        assert_eq!(k.as_bytes()[0], 0x2B);
    }
}
