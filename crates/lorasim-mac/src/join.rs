//! OTAA join server.

use lorawan_packet::crypto::derive_session_keys;
use lorawan_packet::{AesKey, DevAddr, Eui64, JoinAccept, JoinRequest, SecurityError, SessionKeys};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const NWK_ADDR_MASK: u32 = 0x01FF_FFFF;

#[derive(Debug, Clone)]
struct JoinRecord {
    app_key: AesKey,
    last_nonce: Option<u16>,
    dev_addr: Option<DevAddr>,
}

/// Result of an accepted join request.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    /// Sealed JoinAccept PHYPayload.
    pub accept: Vec<u8>,
}

/// Holds root keys and hands out device addresses.
#[derive(Debug, Clone)]
pub struct JoinServer {
    net_id: u32,
    records: BTreeMap<(Eui64, Eui64), JoinRecord>,
    reserved: BTreeSet<DevAddr>,
    next_app_nonce: u32,
    next_nwk_addr: u32,
}

impl JoinServer {
    pub fn new(net_id: u32) -> Self {
        JoinServer {
            net_id: net_id & 0x00FF_FFFF,
            records: BTreeMap::new(),
            reserved: BTreeSet::new(),
            next_app_nonce: 1,
            next_nwk_addr: 1,
        }
    }

    /// Register an OTAA device.
    pub fn register(&mut self, join_eui: Eui64, dev_eui: Eui64, app_key: AesKey) {
        self.records.insert(
            (join_eui, dev_eui),
            JoinRecord {
                app_key,
                last_nonce: None,
                dev_addr: None,
            },
        );
    }

    /// Keep an address (e.g. an ABP device) out of the allocation pool.
    pub fn reserve(&mut self, dev_addr: DevAddr) {
        self.reserved.insert(dev_addr);
    }

    /// Last accepted nonce of a device.
    pub fn last_nonce(&self, join_eui: Eui64, dev_eui: Eui64) -> Option<u16> {
        self.records.get(&(join_eui, dev_eui)).and_then(|r| r.last_nonce)
    }

    fn allocate_addr(&mut self) -> DevAddr {
        let prefix = (self.net_id & 0x7F) << 25;
        loop {
            let addr = DevAddr(prefix | (self.next_nwk_addr & NWK_ADDR_MASK));
            self.next_nwk_addr = self.next_nwk_addr.wrapping_add(1);
            if self.reserved.insert(addr) {
                return addr;
            }
        }
    }

    /// Validate a join request and build the accept.
    ///
    /// Rejects unknown devices, bad MICs and nonces that do not increase.
    pub fn handle_join(&mut self, request: &JoinRequest) -> Result<JoinOutcome, SecurityError> {
        let key = (request.join_eui, request.dev_eui);
        let record = self
            .records
            .get(&key)
            .ok_or_else(|| SecurityError::UnknownDevice(format!("DevEUI {}", request.dev_eui)))?;
        request.verify_mic(&record.app_key)?;
        if let Some(last) = record.last_nonce {
            if request.dev_nonce <= last {
                return Err(SecurityError::ReplayedNonce {
                    dev_eui: request.dev_eui.to_string(),
                    dev_nonce: request.dev_nonce,
                });
            }
        }
        let app_key = record.app_key;
        // a device that re-joins keeps its address
        let dev_addr = match record.dev_addr {
            Some(addr) => addr,
            None => self.allocate_addr(),
        };

        let app_nonce = self.next_app_nonce & 0x00FF_FFFF;
        self.next_app_nonce = self.next_app_nonce.wrapping_add(1);

        let accept = JoinAccept {
            app_nonce,
            net_id: self.net_id,
            dev_addr,
            dl_settings: 0,
            rx_delay: 1,
        }
        .seal(&app_key)?;
        let (nwk_skey, app_skey) = derive_session_keys(&app_key, app_nonce, self.net_id, request.dev_nonce);

        if let Some(record) = self.records.get_mut(&key) {
            record.last_nonce = Some(request.dev_nonce);
            record.dev_addr = Some(dev_addr);
        }
        debug!(
            "JoinServer: accepted DevEUI {} nonce {} -> DevAddr {}",
            request.dev_eui, request.dev_nonce, dev_addr
        );
        Ok(JoinOutcome {
            dev_addr,
            keys: SessionKeys { nwk_skey, app_skey },
            accept,
        })
    }
}
