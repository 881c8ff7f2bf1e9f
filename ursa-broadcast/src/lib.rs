//! Best-effort fanout of processed market events.
//!
//! Each topic is a bounded `tokio::sync::broadcast` channel created lazily
//! on first subscribe or publish. Delivery is at-most-once: publishing never
//! blocks the pipeline and is never retried. Slow subscribers lag, and
//! transport failures are a transport concern.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::trace;

use ursa_core::{agent_channel, MarketEvent, PLATFORM_CHANNEL};

/// Central fanout hub; cloneable via internal `Arc`.
#[derive(Clone)]
pub struct FanoutHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<MarketEvent>>>>,
    capacity: usize,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(16),
        }
    }

    /// Subscribe to a topic, creating the channel if it does not exist.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<MarketEvent> {
        {
            let channels = self.channels.read().expect("fanout lock poisoned");
            if let Some(tx) = channels.get(topic) {
                return tx.subscribe();
            }
        }
        let mut channels = self.channels.write().expect("fanout lock poisoned");
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to one agent's channel.
    pub fn subscribe_agent(&self, agent_id: &str) -> broadcast::Receiver<MarketEvent> {
        self.subscribe(&agent_channel(agent_id))
    }

    /// Subscribe to the platform-wide channel.
    pub fn subscribe_platform(&self) -> broadcast::Receiver<MarketEvent> {
        self.subscribe(PLATFORM_CHANNEL)
    }

    /// Publish an event to its agent channel and the platform channel.
    ///
    /// Returns the number of receivers the event reached; 0 when nothing is
    /// subscribed.
    pub fn publish(&self, event: &MarketEvent) -> usize {
        let reached = self.send_to(&agent_channel(&event.agent_address), event)
            + self.send_to(PLATFORM_CHANNEL, event);
        trace!(agent = %event.agent_address, kind = ?event.kind, reached, "event published");
        reached
    }

    /// Publish a whole batch; invoked once per completed drain cycle to
    /// bound outbound message volume.
    pub fn publish_batch(&self, events: &[MarketEvent]) -> usize {
        events.iter().map(|event| self.publish(event)).sum()
    }

    fn send_to(&self, topic: &str, event: &MarketEvent) -> usize {
        let channels = self.channels.read().expect("fanout lock poisoned");
        match channels.get(topic) {
            Some(tx) => tx.send(event.clone()).unwrap_or(0),
            None => 0,
        }
    }
}
