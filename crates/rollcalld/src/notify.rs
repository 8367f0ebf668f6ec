//! Live event fan-out to session, dashboard and system subscribers.
//!
//! Subscriptions go through an explicit topic-registration table, so the
//! membership of every channel is inspectable and the privileged system
//! channel is enforced at registration time. Delivery is fire-and-forget:
//! publishing never fails the attendance write that triggered it — dead
//! subscribers are pruned on the next publish.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::{ActivityItem, AttendanceRecord};

/// Delivery scope for published events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Observers of one class session.
    Session(String),
    /// Aggregate dashboard observers.
    Dashboard,
    /// Privileged operational alerts.
    System,
}

/// Outbound message, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    AttendanceEvent {
        attendance: AttendanceRecord,
    },
    SessionUpdate {
        session_id: String,
        state: &'static str,
    },
    DashboardUpdate {
        today_count: u64,
        recent_activity: Vec<ActivityItem>,
    },
    SystemAlert {
        alert_type: String,
        message: String,
        severity: String,
    },
    Pong {
        timestamp: Option<serde_json::Value>,
    },
}

/// Inbound client message. Only `ping` is meaningful; unknown types are
/// logged and dropped rather than closing the subscription.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

/// Answer a raw client message. `ping` echoes its timestamp in a `pong`.
pub fn handle_client_message(raw: &str) -> Option<Event> {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(msg) if msg.kind == "ping" => Some(Event::Pong {
            timestamp: msg.timestamp,
        }),
        Ok(msg) => {
            tracing::debug!(kind = %msg.kind, "ignoring unknown client message type");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable client message");
            None
        }
    }
}

#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("system channel requires a privileged subscriber")]
    PrivilegeRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A live registration: keep the receiver to stay subscribed.
pub struct Subscription {
    pub id: SubscriberId,
    pub topic: Topic,
    pub rx: mpsc::UnboundedReceiver<Event>,
}

struct Registration {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    topics: HashMap<Topic, Vec<Registration>>,
}

/// Shared fan-out hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct Hub {
    table: Arc<RwLock<Table>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on a topic. The system topic is refused for
    /// unprivileged callers.
    pub fn subscribe(&self, topic: Topic, privileged: bool) -> Result<Subscription, SubscribeError> {
        if topic == Topic::System && !privileged {
            return Err(SubscribeError::PrivilegeRequired);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.next_id += 1;
        let id = SubscriberId(table.next_id);
        table
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Registration { id, tx });

        tracing::debug!(?topic, id = id.0, "subscriber registered");
        Ok(Subscription { id, topic, rx })
    }

    pub fn unsubscribe(&self, topic: &Topic, id: SubscriberId) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(regs) = table.topics.get_mut(topic) {
            regs.retain(|r| r.id != id);
            if regs.is_empty() {
                table.topics.remove(topic);
            }
        }
    }

    /// Best-effort delivery to every live subscriber of the topic.
    /// Disconnected receivers are dropped from the table; nothing here can
    /// fail the caller.
    pub fn publish(&self, topic: &Topic, event: Event) {
        let dead: Vec<SubscriberId> = {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            let Some(regs) = table.topics.get(topic) else {
                return;
            };
            regs.iter()
                .filter(|reg| reg.tx.send(event.clone()).is_err())
                .map(|reg| reg.id)
                .collect()
        };

        for id in dead {
            tracing::debug!(?topic, id = id.0, "pruning disconnected subscriber");
            self.unsubscribe(topic, id);
        }
    }

    /// Number of live registrations on a topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .topics
            .get(topic)
            .map(|regs| regs.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(message: &str) -> Event {
        Event::SystemAlert {
            alert_type: "test".into(),
            message: message.into(),
            severity: "info".into(),
        }
    }

    fn session_update(session_id: &str) -> Event {
        Event::SessionUpdate {
            session_id: session_id.into(),
            state: "active",
        }
    }

    #[tokio::test]
    async fn events_reach_only_the_published_topic() {
        let hub = Hub::new();
        let mut a = hub
            .subscribe(Topic::Session("sess-a".into()), false)
            .unwrap();
        let mut b = hub
            .subscribe(Topic::Session("sess-b".into()), false)
            .unwrap();

        hub.publish(&Topic::Session("sess-a".into()), session_update("sess-a"));

        let got = a.rx.try_recv().unwrap();
        assert!(matches!(got, Event::SessionUpdate { session_id, .. } if session_id == "sess-a"));
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dashboard_topic_fans_out_to_all_dashboard_subscribers() {
        let hub = Hub::new();
        let mut first = hub.subscribe(Topic::Dashboard, false).unwrap();
        let mut second = hub.subscribe(Topic::Dashboard, false).unwrap();

        hub.publish(
            &Topic::Dashboard,
            Event::DashboardUpdate {
                today_count: 3,
                recent_activity: vec![],
            },
        );

        assert!(first.rx.try_recv().is_ok());
        assert!(second.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn system_topic_requires_privilege() {
        let hub = Hub::new();
        assert!(matches!(
            hub.subscribe(Topic::System, false),
            Err(SubscribeError::PrivilegeRequired)
        ));
        assert!(hub.subscribe(Topic::System, true).is_ok());
    }

    #[tokio::test]
    async fn publish_to_empty_topic_is_a_no_op() {
        let hub = Hub::new();
        hub.publish(&Topic::Dashboard, alert("nobody listening"));
    }

    #[tokio::test]
    async fn disconnected_subscribers_are_pruned_not_fatal() {
        let hub = Hub::new();
        let topic = Topic::Session("sess-a".into());
        let gone = hub.subscribe(topic.clone(), false).unwrap();
        let mut alive = hub.subscribe(topic.clone(), false).unwrap();
        drop(gone.rx);

        hub.publish(&topic, session_update("sess-a"));

        assert!(alive.rx.try_recv().is_ok());
        assert_eq!(hub.subscriber_count(&topic), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let topic = Topic::Dashboard;
        let mut sub = hub.subscribe(topic.clone(), false).unwrap();
        hub.unsubscribe(&topic, sub.id);

        hub.publish(&topic, alert("after unsubscribe"));
        assert!(sub.rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[test]
    fn ping_gets_a_pong_with_echoed_timestamp() {
        let reply = handle_client_message(r#"{"type":"ping","timestamp":1754388000}"#).unwrap();
        let Event::Pong { timestamp } = reply else {
            panic!("expected pong");
        };
        assert_eq!(timestamp, Some(serde_json::json!(1754388000)));
    }

    #[test]
    fn unknown_and_malformed_messages_are_dropped() {
        assert!(handle_client_message(r#"{"type":"subscribe_all"}"#).is_none());
        assert!(handle_client_message("not json at all").is_none());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(session_update("sess-9")).unwrap();
        assert_eq!(json["type"], "session_update");
        assert_eq!(json["data"]["session_id"], "sess-9");
    }
}
