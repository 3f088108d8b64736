//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Conversation`] | Turn lifecycle, agent fallbacks |
//! | [`Topic::Actions`] | Dispatch failures reported back to issuers |
//! | [`Topic::Perception`] | Scene descriptions |
//! | [`Topic::SystemAlerts`] | Degraded modes, registry refreshes, session shutdown |

use clawbody_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation,
    Actions,
    Perception,
    SystemAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    conversation: broadcast::Sender<Event>,
    actions: broadcast::Sender<Event>,
    perception: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (conversation, _) = broadcast::channel(capacity);
        let (actions, _) = broadcast::channel(capacity);
        let (perception, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            conversation,
            actions,
            perception,
            system_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`].
    ///
    /// Returns the number of receivers handed the event; `0` when nobody is
    /// listening, which is a normal condition for a headless robot.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(?topic, source = %event.source, "no subscribers; event dropped");
                0
            }
        }
    }

    /// Wrap `payload` in an [`Event`] stamped with `source` and publish it.
    pub fn emit(&self, topic: Topic, source: &str, payload: EventPayload) -> usize {
        self.publish_to(topic, Event::new(source, payload))
    }

    /// Subscribe to a specific [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Conversation => &self.conversation,
            Topic::Actions => &self.actions,
            Topic::Perception => &self.perception,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Like [`recv`][Self::recv] but skips over lag, returning `None` only
    /// once the bus is closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn refreshed(generation: u64) -> Event {
        Event::new(
            "clawbody-middleware::test",
            EventPayload::BehaviorsRefreshed {
                generation,
                count: 3,
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::SystemAlerts, refreshed(1)), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::Conversation);
        let mut second = bus.subscribe_to(Topic::Conversation);

        let event = refreshed(7);
        assert_eq!(bus.publish_to(Topic::Conversation, event.clone()), 2);

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let _perception = bus.subscribe_to(Topic::Perception);

        bus.emit(
            Topic::Perception,
            "clawbody-perception",
            EventPayload::BehaviorsRefreshed {
                generation: 1,
                count: 0,
            },
        );

        let result = tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "SystemAlerts must not see Perception traffic");
    }

    #[tokio::test]
    async fn next_event_skips_lag() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::Actions);
        for generation in 0..20 {
            bus.publish_to(Topic::Actions, refreshed(generation));
        }

        let event = slow.next_event().await.expect("bus still open");
        match event.payload {
            EventPayload::BehaviorsRefreshed { generation, .. } => assert_eq!(generation, 16),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
