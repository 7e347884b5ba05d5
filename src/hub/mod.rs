//! Downstream session hub
//!
//! Tracks every connected session with its subscription set and a bounded
//! outbound queue. Fan-out never waits on a session: a frame is offered with
//! `try_send`, and a session whose queue is full or closed is pruned on the
//! spot. Dropping a session's sender is what closes its socket writer.

pub mod server;

use crate::config::{LimitsSection, ServerSection, TopicsSection};
use crate::error::RelayError;
use crate::processing::{ClassifiedResult, CommandValidator};
use crate::protocol::{
    topic_matches, validate_pattern, validate_publish_topic, PublishOptions, QosLevel,
    TopicError, WireMessage, WireMessageType,
};
use crate::transport::Transport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session management errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    #[error("session {0} is closed")]
    SessionClosed(Uuid),
    #[error("hub is shutting down")]
    ShuttingDown,
    #[error("invalid pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: TopicError,
    },
}

struct Session {
    subscriptions: BTreeMap<String, QosLevel>,
    outbound: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
}

/// Handle given to the socket task of a newly accepted session
#[derive(Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<String>,
}

/// Serializable view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Result of one fan-out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    /// Sessions whose subscriptions matched
    pub matched: usize,
    pub delivered: usize,
    pub pruned: Vec<Uuid>,
}

/// What a client publish turned into upstream
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub topic: String,
    /// Clamping notes for control commands
    pub warnings: Vec<String>,
}

pub struct ClientHub {
    sessions: RwLock<HashMap<Uuid, Session>>,
    accepting: AtomicBool,
    queue_capacity: usize,
    default_subscriptions: Vec<String>,
    control_prefix: String,
    commands: CommandValidator,
}

impl std::fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHub")
            .field("queue_capacity", &self.queue_capacity)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl ClientHub {
    pub fn new(server: &ServerSection, topics: &TopicsSection, limits: LimitsSection) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            queue_capacity: server.outbound_queue.max(1),
            default_subscriptions: server.default_subscriptions.clone(),
            control_prefix: format!("{}/", topics.control_prefix.trim_end_matches('/')),
            commands: CommandValidator::new(limits),
        }
    }

    /// Register a new session and queue its welcome frame
    pub async fn accept(&self) -> Result<SessionHandle, HubError> {
        if !self.is_accepting() {
            return Err(HubError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let (outbound, receiver) = mpsc::channel(self.queue_capacity);

        let subscriptions: BTreeMap<String, QosLevel> = self
            .default_subscriptions
            .iter()
            .filter(|p| validate_pattern(p).is_ok())
            .map(|p| (p.clone(), QosLevel::AtMostOnce))
            .collect();

        let welcome = WireMessage::new(WireMessageType::Welcome).with_data(serde_json::json!({
            "sessionId": id,
            "subscriptions": subscriptions.keys().collect::<Vec<_>>(),
        }));
        if let Ok(frame) = welcome.to_json() {
            let _ = outbound.try_send(frame);
        }

        self.sessions.write().await.insert(
            id,
            Session {
                subscriptions,
                outbound,
                connected_at: Utc::now(),
            },
        );
        info!(session_id = %id, "Session accepted");
        Ok(SessionHandle {
            id,
            outbound: receiver,
        })
    }

    /// Add a pattern to one session; re-adding is a no-op
    pub async fn subscribe(&self, id: Uuid, pattern: &str, qos: QosLevel) -> Result<(), HubError> {
        validate_pattern(pattern).map_err(|source| HubError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(HubError::UnknownSession(id))?;
        session.subscriptions.insert(pattern.to_string(), qos);
        debug!(session_id = %id, pattern = %pattern, "Session subscribed");
        Ok(())
    }

    /// Remove a pattern; returns whether it was present
    pub async fn unsubscribe(&self, id: Uuid, pattern: &str) -> Result<bool, HubError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(HubError::UnknownSession(id))?;
        let removed = session.subscriptions.remove(pattern).is_some();
        debug!(session_id = %id, pattern = %pattern, removed, "Session unsubscribed");
        Ok(removed)
    }

    pub async fn subscriptions(&self, id: Uuid) -> Result<Vec<String>, HubError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&id).ok_or(HubError::UnknownSession(id))?;
        Ok(session.subscriptions.keys().cloned().collect())
    }

    /// Deliver a classified result to every session subscribed to its topic
    pub async fn broadcast(&self, result: &ClassifiedResult) -> BroadcastReport {
        let data = match serde_json::to_value(result) {
            Ok(data) => data,
            Err(e) => {
                warn!(topic = %result.topic, error = %e, "Failed to serialize result");
                return BroadcastReport::default();
            }
        };
        let message = WireMessage::new(WireMessageType::Message)
            .with_topic(&result.topic)
            .with_data(data)
            .with_qos(result.qos);
        self.fan_out(&message, Some(&result.topic)).await
    }

    /// Deliver a frame to every session regardless of subscriptions
    pub async fn broadcast_all(&self, message: &WireMessage) -> BroadcastReport {
        self.fan_out(message, None).await
    }

    async fn fan_out(&self, message: &WireMessage, topic: Option<&str>) -> BroadcastReport {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to serialize frame");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let wanted = match topic {
                    Some(topic) => session
                        .subscriptions
                        .keys()
                        .any(|pattern| topic_matches(pattern, topic)),
                    None => true,
                };
                if !wanted {
                    continue;
                }
                report.matched += 1;
                match session.outbound.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session_id = %id, "Session outbound queue full, disconnecting");
                        report.pruned.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(session_id = %id, "Session closed, pruning");
                        report.pruned.push(*id);
                    }
                }
            }
        }

        if !report.pruned.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &report.pruned {
                sessions.remove(id);
            }
        }
        report
    }

    /// Send one frame to one session; a full or closed queue drops the session
    pub async fn send_to(&self, id: Uuid, message: &WireMessage) -> Result<(), HubError> {
        let frame = message
            .to_json()
            .map_err(|_| HubError::SessionClosed(id))?;
        let outcome = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(&id).ok_or(HubError::UnknownSession(id))?;
            session.outbound.try_send(frame)
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => {
                self.remove(id).await;
                Err(HubError::SessionClosed(id))
            }
        }
    }

    /// Forward a client publish upstream
    ///
    /// Control commands are validated first: the clamped form is what goes
    /// upstream, and a rejected command is not forwarded at all.
    pub async fn relay_publish<T: Transport + ?Sized>(
        &self,
        transport: &T,
        id: Uuid,
        topic: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt, RelayError> {
        if !self.sessions.read().await.contains_key(&id) {
            return Err(HubError::UnknownSession(id).into());
        }
        validate_publish_topic(topic)?;

        let raw = match message {
            Value::String(text) => Bytes::from(text.clone()),
            other => Bytes::from(serde_json::to_vec(other).map_err(|e| {
                RelayError::invalid_request(format!("unserializable message: {e}"))
            })?),
        };

        let (payload, warnings) = if topic.starts_with(&self.control_prefix) {
            let outcome = self.commands.validate(topic, &raw);
            if !outcome.validation.is_accepted() {
                let reason = outcome
                    .validation
                    .reason
                    .unwrap_or_else(|| "command rejected".to_string());
                warn!(session_id = %id, topic = %topic, reason = %reason, "Client command rejected");
                return Err(RelayError::rejected(topic, reason));
            }
            let payload = if outcome.parameters.is_null() {
                raw
            } else {
                Bytes::from(serde_json::to_vec(&outcome.parameters).map_err(|e| {
                    RelayError::invalid_request(format!("unserializable command: {e}"))
                })?)
            };
            (payload, outcome.validation.warnings)
        } else {
            (raw, Vec::new())
        };

        transport.publish(topic, payload, options).await?;
        debug!(session_id = %id, topic = %topic, "Client publish forwarded");
        Ok(PublishReceipt {
            topic: topic.to_string(),
            warnings,
        })
    }

    /// Drop a session; returns whether it existed
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            info!(session_id = %id, "Session removed");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| SessionInfo {
                id: *id,
                subscriptions: s.subscriptions.keys().cloned().collect(),
                connected_at: s.connected_at,
            })
            .collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new sessions from now on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Drop every session; their socket writers close once queues drain
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{Category, Validation};
    use crate::testing::MockTransport;
    use serde_json::json;

    fn hub_with_queue(outbound_queue: usize) -> ClientHub {
        let server = ServerSection {
            outbound_queue,
            ..ServerSection::default()
        };
        ClientHub::new(&server, &TopicsSection::default(), LimitsSection::default())
    }

    fn result(topic: &str) -> ClassifiedResult {
        ClassifiedResult {
            topic: topic.to_string(),
            category: Category::Other,
            normalized_data: json!(1),
            validation: Validation::accepted(),
            timestamp: Utc::now(),
            qos: QosLevel::AtMostOnce,
            emergency: None,
        }
    }

    async fn accept_drained(hub: &ClientHub) -> SessionHandle {
        let mut handle = hub.accept().await.unwrap();
        let welcome = handle.outbound.recv().await.unwrap();
        assert!(welcome.contains("\"welcome\""));
        handle
    }

    #[tokio::test]
    async fn test_broadcast_respects_subscriptions() {
        let hub = hub_with_queue(8);
        let mut weight = accept_drained(&hub).await;
        let mut everything = accept_drained(&hub).await;
        let mut nothing = accept_drained(&hub).await;

        hub.subscribe(weight.id, "scale/+", QosLevel::AtMostOnce)
            .await
            .unwrap();
        hub.subscribe(everything.id, "*", QosLevel::AtMostOnce)
            .await
            .unwrap();

        let report = hub.broadcast(&result("scale/weight")).await;
        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 2);

        let frame: Value = serde_json::from_str(&weight.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["topic"], "scale/weight");
        assert!(everything.outbound.recv().await.is_some());
        assert!(nothing.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unwritable_session_is_pruned_without_blocking_others() {
        let hub = hub_with_queue(8);
        let dead = accept_drained(&hub).await;
        let mut alive = accept_drained(&hub).await;
        for id in [dead.id, alive.id] {
            hub.subscribe(id, "*", QosLevel::AtMostOnce).await.unwrap();
        }
        let dead_id = dead.id;
        drop(dead);

        let report = hub.broadcast(&result("robot/topics")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![dead_id]);
        assert!(alive.outbound.recv().await.is_some());
        assert_eq!(hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_slow_session_is_disconnected_at_queue_limit() {
        let hub = hub_with_queue(2);
        let slow = accept_drained(&hub).await;
        hub.subscribe(slow.id, "*", QosLevel::AtMostOnce)
            .await
            .unwrap();

        assert_eq!(hub.broadcast(&result("a")).await.delivered, 1);
        assert_eq!(hub.broadcast(&result("a")).await.delivered, 1);
        let report = hub.broadcast(&result("a")).await;
        assert_eq!(report.pruned, vec![slow.id]);
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_changes_are_per_session() {
        let hub = hub_with_queue(8);
        let a = accept_drained(&hub).await;
        let b = accept_drained(&hub).await;

        hub.subscribe(a.id, "robot/#", QosLevel::AtLeastOnce)
            .await
            .unwrap();
        hub.subscribe(a.id, "robot/#", QosLevel::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(hub.subscriptions(a.id).await.unwrap(), vec!["robot/#"]);
        assert!(hub.subscriptions(b.id).await.unwrap().is_empty());

        assert!(hub.unsubscribe(a.id, "robot/#").await.unwrap());
        assert!(!hub.unsubscribe(a.id, "robot/#").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_pattern_and_unknown_session() {
        let hub = hub_with_queue(8);
        let a = accept_drained(&hub).await;
        assert!(matches!(
            hub.subscribe(a.id, "robot/#/x", QosLevel::AtMostOnce).await,
            Err(HubError::InvalidPattern { .. })
        ));
        assert!(matches!(
            hub.subscribe(Uuid::new_v4(), "a", QosLevel::AtMostOnce).await,
            Err(HubError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_default_subscriptions_apply_to_new_sessions() {
        let server = ServerSection {
            default_subscriptions: vec!["*".to_string()],
            ..ServerSection::default()
        };
        let hub = ClientHub::new(&server, &TopicsSection::default(), LimitsSection::default());
        let session = hub.accept().await.unwrap();
        assert_eq!(hub.subscriptions(session.id).await.unwrap(), vec!["*"]);
    }

    #[tokio::test]
    async fn test_stop_accepting_refuses_new_sessions() {
        let hub = hub_with_queue(8);
        let _existing = hub.accept().await.unwrap();
        hub.stop_accepting();
        assert!(matches!(hub.accept().await, Err(HubError::ShuttingDown)));
        assert_eq!(hub.close_all().await, 1);
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_publish_forwards_plain_topics_verbatim() {
        let hub = hub_with_queue(8);
        let transport = MockTransport::connected();
        let session = hub.accept().await.unwrap();

        hub.relay_publish(
            &transport,
            session.id,
            "dashboard/note",
            &json!("hello"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

        let published = transport.get_published().await;
        assert_eq!(published[0].topic, "dashboard/note");
        assert_eq!(published[0].payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_relay_publish_forwards_clamped_joint_command() {
        let hub = hub_with_queue(8);
        let transport = MockTransport::connected();
        let session = hub.accept().await.unwrap();

        let receipt = hub
            .relay_publish(
                &transport,
                session.id,
                "robot/control/move_joint",
                &json!([0, 0, 0, 0, 0, 400]),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.warnings.len(), 1);

        let published = transport.get_published().await;
        let forwarded = published[0].json();
        assert_eq!(forwarded["positions"][5], 360.0);
    }

    #[tokio::test]
    async fn test_relay_publish_rejected_command_not_forwarded() {
        let hub = hub_with_queue(8);
        let transport = MockTransport::connected();
        let session = hub.accept().await.unwrap();

        let result = hub
            .relay_publish(
                &transport,
                session.id,
                "robot/control/teleport",
                &json!({}),
                PublishOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(RelayError::ValidationRejection { .. })));
        assert!(transport.get_published().await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_publish_fails_fast_when_disconnected() {
        let hub = hub_with_queue(8);
        let transport = MockTransport::new();
        let session = hub.accept().await.unwrap();

        let result = hub
            .relay_publish(
                &transport,
                session.id,
                "dashboard/note",
                &json!({"a": 1}),
                PublishOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(RelayError::Broker(_))));
    }
}
