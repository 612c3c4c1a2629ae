//! Channel-based publish/subscribe between entities
//!
//! Channels hold entity ids, never entity objects; delivery resolves ids
//! through the caller, so the bus never owns or inspects an entity.

use std::collections::{BTreeSet, HashMap};

use super::state::EntityId;

/// Channel every entity joins on creation
pub const GLOBAL_CHANNEL: &str = "global";

/// Who is emitting, and where a channel-less emit goes. System code has
/// no id and no outbound channels.
#[derive(Debug, Clone, Copy)]
pub struct Sender<'a> {
    pub id: Option<EntityId>,
    pub channels_out: &'a [String],
}

#[derive(Debug, Default, Clone)]
pub struct SignalBus {
    channels: HashMap<String, BTreeSet<EntityId>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity to each named channel
    pub fn subscribe<S: AsRef<str>>(&mut self, id: EntityId, channels: &[S]) {
        for channel in channels {
            self.channels
                .entry(channel.as_ref().to_string())
                .or_default()
                .insert(id);
        }
    }

    /// Remove an entity from one channel, pruning the channel if it empties
    pub fn unsubscribe(&mut self, id: EntityId, channel: &str) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Remove an entity from every channel it is listed in
    pub fn unsubscribe_all<S: AsRef<str>>(&mut self, id: EntityId, channels: &[S]) {
        for channel in channels {
            self.unsubscribe(id, channel.as_ref());
        }
    }

    pub fn subscribers(&self, channel: &str) -> Vec<EntityId> {
        self.channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    /// Resolve recipients.
    ///
    /// With a target channel every current subscriber receives the signal,
    /// the sender included. Without one, the union of the sender's outbound
    /// channels receives it, excluding the sender itself. Each recipient is
    /// listed once, in ascending id order per channel.
    pub fn route(&self, sender: &Sender<'_>, target: Option<&str>) -> Vec<EntityId> {
        if let Some(channel) = target {
            return self.subscribers(channel);
        }

        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for channel in sender.channels_out {
            for id in self.subscribers(channel) {
                if Some(id) != sender.id && seen.insert(id) {
                    out.push(id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targeted_route_reaches_exactly_the_channel_including_sender() {
        let mut bus = SignalBus::new();
        bus.subscribe(1, &["enemies", "global"]);
        bus.subscribe(2, &["enemies"]);
        bus.subscribe(3, &["players"]);

        let outbound = vec!["players".to_string()];
        let sender = Sender {
            id: Some(1),
            channels_out: &outbound,
        };
        assert_eq!(bus.route(&sender, Some("enemies")), vec![1, 2]);
    }

    #[test]
    fn broadcast_form_skips_sender_and_dedupes() {
        let mut bus = SignalBus::new();
        bus.subscribe(1, &["a", "b"]);
        bus.subscribe(2, &["a", "b"]);
        bus.subscribe(3, &["b"]);

        let outbound = vec!["a".to_string(), "b".to_string()];
        let sender = Sender {
            id: Some(1),
            channels_out: &outbound,
        };
        assert_eq!(bus.route(&sender, None), vec![2, 3]);
    }

    #[test]
    fn empty_channels_are_pruned() {
        let mut bus = SignalBus::new();
        bus.subscribe(7, &["solo", GLOBAL_CHANNEL]);
        assert!(bus.unsubscribe(7, "solo"));
        assert!(!bus.has_channel("solo"));
        assert!(!bus.unsubscribe(7, "solo"));

        bus.unsubscribe_all(7, &[GLOBAL_CHANNEL]);
        assert!(bus.channels.is_empty());
    }

    #[test]
    fn system_sender_without_target_reaches_nobody() {
        let mut bus = SignalBus::new();
        bus.subscribe(1, &[GLOBAL_CHANNEL]);
        let system = Sender {
            id: None,
            channels_out: &[],
        };
        assert!(bus.route(&system, None).is_empty());
        assert_eq!(bus.route(&system, Some(GLOBAL_CHANNEL)), vec![1]);
    }
}
