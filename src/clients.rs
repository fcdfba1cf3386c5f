//! Connected clients and the external services reacting to them.
//!
//! The event pipeline only knows these collaborators through traits:
//! - [`ClientTracker`]: who is on the server, and which latency each human address gets.
//!   [`ClientRegistry`] is the in-memory implementation.
//! - [`RecordingSink`]: per-client screen recording. [`NoRecording`] when no recorder is used.
//! - [`LatencySink`]: traffic shaping of the client addresses. [`DisabledLatency`] when latency
//!   control is off.
//!
//! The tracker is only written from the ingestion thread. Sinks run on the side-effect runtime
//! and get their inputs by value.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

/// Names OpenArena gives to its bots. A client with one of them is always a bot.
pub const BOT_NAMES: [&str; 8] = [
    "Angelyss", "Arachna", "Major", "Sarge", "Skelebot", "Merman", "Beret", "Kyonshi",
];

/// Latency, in milliseconds, assigned to one human address.
pub type LatencyAssignment = (Ipv4Addr, u32);

#[cfg_attr(test, automock)]
pub trait ClientTracker: Send {
    fn add_client(
        &mut self,
        id: u32,
        address: Option<Ipv4Addr>,
        latency: Option<u32>,
        name: Option<String>,
        is_bot: bool,
    );

    /// Forget `id`. The only way a client leaves the tracker.
    fn remove_client(&mut self, id: u32);

    fn is_tracked(&self, id: u32) -> bool;

    fn address_of(&self, id: u32) -> Option<Ipv4Addr>;

    fn human_count(&self) -> usize;

    fn bot_count(&self) -> usize;

    /// Number of distinct human addresses holding a latency.
    fn assigned_address_count(&self) -> usize;

    /// Address to latency, in first-seen order.
    fn latency_assignments(&self) -> Vec<LatencyAssignment>;

    /// Give `latencies` round-robin to the known addresses, in first-seen order.
    fn assign_latencies(&mut self, latencies: &[u32]);
}

#[derive(Debug, Clone, PartialEq)]
struct TrackedClient {
    name: Option<String>,
    address: Option<Ipv4Addr>,
    is_bot: bool,
}

/// In-memory [`ClientTracker`].
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<u32, TrackedClient>,
    latencies: Vec<LatencyAssignment>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.clients.get(&id)?.name.as_deref()
    }

    pub fn is_bot(&self, id: u32) -> bool {
        self.clients.get(&id).is_some_and(|client| client.is_bot)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn latency_of(&self, address: Ipv4Addr) -> Option<u32> {
        self.latencies
            .iter()
            .find(|(known, _)| *known == address)
            .map(|(_, latency)| *latency)
    }
}

impl ClientTracker for ClientRegistry {
    fn add_client(
        &mut self,
        id: u32,
        address: Option<Ipv4Addr>,
        latency: Option<u32>,
        name: Option<String>,
        is_bot: bool,
    ) {
        let is_bot = is_bot
            || name
                .as_deref()
                .is_some_and(|name| BOT_NAMES.contains(&name));
        let address = if is_bot { None } else { address };

        if let Some(address) = address {
            match self.latency_of(address) {
                Some(_) => debug!(id, %address, "address already tracked"),
                None => {
                    let latency = latency.unwrap_or(0);
                    self.latencies.push((address, latency));
                    info!(id, %address, latency, "human client added");
                }
            }
        } else if is_bot {
            info!(id, name = name.as_deref().unwrap_or("?"), "bot client added");
        }

        self.clients.insert(
            id,
            TrackedClient {
                name,
                address,
                is_bot,
            },
        );
    }

    fn remove_client(&mut self, id: u32) {
        let Some(client) = self.clients.remove(&id) else {
            warn!(id, "removing unknown client");
            return;
        };
        if let Some(address) = client.address {
            let still_used = self
                .clients
                .values()
                .any(|other| other.address == Some(address));
            if still_used {
                debug!(id, %address, "address still used by another client");
            } else {
                self.latencies.retain(|(known, _)| *known != address);
            }
        }
        info!(id, remaining = self.clients.len(), "client removed");
    }

    fn is_tracked(&self, id: u32) -> bool {
        self.clients.contains_key(&id)
    }

    fn address_of(&self, id: u32) -> Option<Ipv4Addr> {
        self.clients.get(&id)?.address
    }

    fn human_count(&self) -> usize {
        self.clients.values().filter(|client| !client.is_bot).count()
    }

    fn bot_count(&self) -> usize {
        self.clients.values().filter(|client| client.is_bot).count()
    }

    fn assigned_address_count(&self) -> usize {
        self.latencies.len()
    }

    fn latency_assignments(&self) -> Vec<LatencyAssignment> {
        self.latencies.clone()
    }

    fn assign_latencies(&mut self, latencies: &[u32]) {
        if latencies.is_empty() || self.latencies.is_empty() {
            return;
        }
        for (i, (_, latency)) in self.latencies.iter_mut().enumerate() {
            *latency = latencies[i % latencies.len()];
        }
        info!(assignments = ?self.latencies, "latencies assigned");
    }
}

/// Latency levels of the experiment, rotated after every completed round.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySchedule {
    levels: Vec<u32>,
    rotations: u32,
}

impl LatencySchedule {
    pub fn new(levels: Vec<u32>) -> Self {
        Self {
            levels,
            rotations: 0,
        }
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    /// Latency for the next human address, given how many already hold one.
    pub fn level_for(&self, assigned: usize) -> Option<u32> {
        if self.levels.is_empty() {
            return None;
        }
        Some(self.levels[assigned % self.levels.len()])
    }

    /// Shift the levels left by one.
    pub fn rotate(&mut self) -> &[u32] {
        if !self.levels.is_empty() {
            self.levels.rotate_left(1);
        }
        self.rotations += 1;
        &self.levels
    }

    /// In-game message describing the current levels.
    pub fn announcement(&self) -> String {
        let levels = self
            .levels
            .iter()
            .map(|level| format!("{level}ms"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("say Round {}: New latencies - {}", self.rotations, levels)
    }
}

/// Screen recording of the human clients.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Whether recording is used at all. A disabled sink is never called.
    fn is_enabled(&self) -> bool;

    /// Reach the recorder of `address`. `false` when it cannot be reached.
    async fn connect_client(&self, address: Ipv4Addr) -> bool;

    async fn disconnect_client(&self, address: Ipv4Addr);

    /// Start recording everywhere. Success per address.
    async fn start_all(&self) -> HashMap<Ipv4Addr, bool>;

    /// Stop recording everywhere. Success per address.
    async fn stop_all(&self) -> HashMap<Ipv4Addr, bool>;

    async fn cleanup(&self);
}

/// Recording sink for runs without a recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecording;

#[async_trait]
impl RecordingSink for NoRecording {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn connect_client(&self, _address: Ipv4Addr) -> bool {
        true
    }

    async fn disconnect_client(&self, _address: Ipv4Addr) {}

    async fn start_all(&self) -> HashMap<Ipv4Addr, bool> {
        HashMap::new()
    }

    async fn stop_all(&self) -> HashMap<Ipv4Addr, bool> {
        HashMap::new()
    }

    async fn cleanup(&self) {}
}

/// Traffic shaping of the human client addresses.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LatencySink: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn apply(&self, assignments: Vec<LatencyAssignment>) -> bool;

    async fn rotate(&self, assignments: Vec<LatencyAssignment>) -> bool;

    async fn clear(&self) -> bool;
}

/// Latency sink used when latency control is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLatency;

#[async_trait]
impl LatencySink for DisabledLatency {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn apply(&self, _assignments: Vec<LatencyAssignment>) -> bool {
        true
    }

    async fn rotate(&self, _assignments: Vec<LatencyAssignment>) -> bool {
        true
    }

    async fn clear(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod clients_tests {
    use super::*;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn humans_and_bots_are_counted() {
        let mut registry = ClientRegistry::new();
        registry.add_client(0, Some(addr(1)), Some(0), Some("alice".into()), false);
        registry.add_client(1, None, None, Some("Sarge".into()), false);
        registry.add_client(2, None, None, Some("custom".into()), true);

        assert_eq!(registry.human_count(), 1);
        assert_eq!(registry.bot_count(), 2);
        assert!(registry.is_bot(1));
        assert_eq!(registry.address_of(0), Some(addr(1)));
        assert_eq!(registry.name_of(0), Some("alice"));
    }

    #[test]
    fn known_bot_name_never_gets_an_address() {
        let mut registry = ClientRegistry::new();
        registry.add_client(4, Some(addr(4)), Some(50), Some("Major".into()), false);
        assert!(registry.is_bot(4));
        assert_eq!(registry.address_of(4), None);
        assert_eq!(registry.assigned_address_count(), 0);
    }

    #[test]
    fn shared_address_survives_one_removal() {
        let mut registry = ClientRegistry::new();
        registry.add_client(1, Some(addr(1)), Some(0), None, false);
        registry.add_client(2, Some(addr(1)), Some(100), None, false);
        assert_eq!(registry.latency_assignments(), vec![(addr(1), 0)]);

        registry.remove_client(1);
        assert_eq!(registry.assigned_address_count(), 1);
        registry.remove_client(2);
        assert_eq!(registry.assigned_address_count(), 0);
        assert!(registry.is_empty());

        // unknown id is only logged
        registry.remove_client(2);
    }

    #[test]
    fn latencies_are_assigned_round_robin_in_first_seen_order() {
        let mut registry = ClientRegistry::new();
        for last in [3, 1, 2] {
            registry.add_client(last as u32, Some(addr(last)), None, None, false);
        }
        registry.assign_latencies(&[0, 100]);
        assert_eq!(
            registry.latency_assignments(),
            vec![(addr(3), 0), (addr(1), 100), (addr(2), 0)]
        );
    }

    #[test]
    fn schedule_rotation() {
        let mut schedule = LatencySchedule::new(vec![0, 50, 100]);
        assert_eq!(schedule.level_for(0), Some(0));
        assert_eq!(schedule.level_for(4), Some(50));

        assert_eq!(schedule.rotate(), &[50, 100, 0]);
        assert_eq!(
            schedule.announcement(),
            "say Round 1: New latencies - 50ms, 100ms, 0ms"
        );
        schedule.rotate();
        assert_eq!(schedule.rotations(), 2);
        assert_eq!(schedule.levels(), &[100, 0, 50]);

        assert_eq!(LatencySchedule::new(vec![]).level_for(0), None);
    }
}
