//! Per-neighbor link state kept by the MAC.

use std::collections::{HashMap, VecDeque};

use tokio::time::{Duration, Instant};

use crate::mac_frame::MacAddress;

#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub address: MacAddress,
    pub last_sequence: u8,
    recent: VecDeque<u8>,
    pub last_seen: Instant,
    pub lqi: u8,
    pub rssi_db: f32,
    pub frames: u64,
    /// An acknowledgement to this neighbor is still outstanding.
    pub pending_ack: bool,
}

impl NeighborEntry {
    fn new(address: MacAddress, now: Instant) -> Self {
        Self {
            address,
            last_sequence: 0,
            recent: VecDeque::new(),
            last_seen: now,
            lqi: 0,
            rssi_db: 0.0,
            frames: 0,
            pending_ack: false,
        }
    }
}

#[derive(Debug)]
pub struct NeighborTable {
    entries: HashMap<MacAddress, NeighborEntry>,
    dedup_window: usize,
    capacity: usize,
    inactivity: Duration,
    evictions: u64,
}

impl NeighborTable {
    pub fn new(capacity: usize, dedup_window: usize, inactivity: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            dedup_window: dedup_window.max(1),
            capacity: capacity.max(1),
            inactivity,
            evictions: 0,
        }
    }

    /// Records a received data frame. Returns `false` if `sequence` was
    /// already seen recently from `address`.
    pub fn observe(
        &mut self,
        address: MacAddress,
        sequence: u8,
        lqi: u8,
        rssi_db: f32,
        now: Instant,
    ) -> bool {
        self.make_room(&address);

        let window = self.dedup_window;
        let entry = self
            .entries
            .entry(address)
            .or_insert_with(|| NeighborEntry::new(address, now));
        entry.last_seen = now;
        entry.lqi = lqi;
        entry.rssi_db = rssi_db;

        if entry.recent.contains(&sequence) {
            return false;
        }
        if entry.recent.len() == window {
            entry.recent.pop_front();
        }
        entry.recent.push_back(sequence);
        entry.last_sequence = sequence;
        entry.frames += 1;
        true
    }

    pub fn set_pending_ack(&mut self, address: MacAddress, pending: bool, now: Instant) {
        if !pending && !self.entries.contains_key(&address) {
            return;
        }
        self.make_room(&address);
        self.entries
            .entry(address)
            .or_insert_with(|| NeighborEntry::new(address, now))
            .pending_ack = pending;
    }

    /// Drops neighbors silent for longer than the inactivity timeout.
    pub fn evict_inactive(&mut self, now: Instant) -> usize {
        let inactivity = self.inactivity;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.pending_ack || now.saturating_duration_since(e.last_seen) <= inactivity);
        let evicted = before - self.entries.len();
        self.evictions += evicted as u64;
        evicted
    }

    fn make_room(&mut self, address: &MacAddress) {
        if !self.entries.contains_key(address) && self.entries.len() >= self.capacity {
            self.evict_stalest();
        }
    }

    fn evict_stalest(&mut self) {
        // Neighbors awaiting an ACK go last.
        let stalest = self
            .entries
            .values()
            .min_by_key(|e| (e.pending_ack, e.last_seen))
            .map(|e| e.address);
        if let Some(address) = stalest {
            self.entries.remove(&address);
            self.evictions += 1;
        }
    }

    pub fn get(&self, address: &MacAddress) -> Option<&NeighborEntry> {
        self.entries.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
