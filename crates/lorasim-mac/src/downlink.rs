//! Per-device downlink queue.

use lorawan_packet::MacCommand;
use std::collections::VecDeque;

/// Downlink priority. Control traffic always leaves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// MAC commands, acknowledgements, join accepts.
    Control,
    /// Application payloads.
    Data,
}

/// One queued downlink item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownlinkItem {
    /// MAC command to piggyback on the next downlink.
    MacCommand(MacCommand),
    /// Sealed join accept PHYPayload.
    JoinAccept(Vec<u8>),
    /// Application payload for a port.
    Application { port: u8, payload: Vec<u8> },
}

impl DownlinkItem {
    /// Priority class of this item.
    pub fn priority(&self) -> Priority {
        match self {
            DownlinkItem::MacCommand(_) | DownlinkItem::JoinAccept(_) => Priority::Control,
            DownlinkItem::Application { .. } => Priority::Data,
        }
    }
}

/// Two-level FIFO: control items before data items.
#[derive(Debug, Clone, Default)]
pub struct DownlinkQueue {
    control: VecDeque<DownlinkItem>,
    data: VecDeque<DownlinkItem>,
}

impl DownlinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&mut self, priority: Priority) -> &mut VecDeque<DownlinkItem> {
        match priority {
            Priority::Control => &mut self.control,
            Priority::Data => &mut self.data,
        }
    }

    /// Append an item behind others of the same priority.
    pub fn push(&mut self, item: DownlinkItem) {
        let lane = self.lane(item.priority());
        lane.push_back(item);
    }

    /// Put an item back at the head of its priority, e.g. after a missed slot.
    pub fn push_front(&mut self, item: DownlinkItem) {
        let lane = self.lane(item.priority());
        lane.push_front(item);
    }

    /// Next item in priority order.
    pub fn pop(&mut self) -> Option<DownlinkItem> {
        self.control.pop_front().or_else(|| self.data.pop_front())
    }

    /// Next item without removing it.
    pub fn peek(&self) -> Option<&DownlinkItem> {
        self.control.front().or_else(|| self.data.front())
    }

    /// Remove and return every queued MAC command, in order.
    pub fn drain_mac_commands(&mut self) -> Vec<MacCommand> {
        let mut commands = Vec::new();
        let mut rest = VecDeque::with_capacity(self.control.len());
        for item in self.control.drain(..) {
            match item {
                DownlinkItem::MacCommand(cmd) => commands.push(cmd),
                other => rest.push_back(other),
            }
        }
        self.control = rest;
        commands
    }

    /// True if a LinkADRReq is waiting.
    pub fn has_link_adr_req(&self) -> bool {
        self.control
            .iter()
            .any(|item| matches!(item, DownlinkItem::MacCommand(MacCommand::LinkAdrReq { .. })))
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.data.is_empty()
    }
}
