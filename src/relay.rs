//! Relay context and lifecycle
//!
//! [`RelayContext`] is built once by the entry point and passed by reference
//! to every task. It owns the shared pieces (ring buffers, session hub,
//! metrics and latest health snapshot) so that several relays can live side
//! by side in one test process.

use crate::buffer::TopicBuffers;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::hub::ClientHub;
use crate::observability::MetricsCollector;
use crate::processing::{ClassifiedResult, MessagePipeline, TopicClassifier};
use crate::protocol::{
    ClientMessage, MessageEnvelope, PublishOptions, QosLevel, WireMessage, WireMessageType,
    ALL_TOPICS,
};
use crate::session_span;
use crate::transport::{BrokerEvent, ManualReconnect, Transport};
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Entries returned by `get_history` when the client gives no count
const DEFAULT_HISTORY_COUNT: usize = 50;

pub struct RelayContext<T: Transport> {
    pub config: Arc<RelayConfig>,
    pub transport: Arc<T>,
    pub buffers: Arc<TopicBuffers<ClassifiedResult>>,
    pub hub: Arc<ClientHub>,
    pub metrics: Arc<MetricsCollector>,
    health: watch::Sender<Option<HealthSnapshot>>,
    shutdown: watch::Sender<bool>,
}

/// Background tasks started by [`RelayContext::spawn_tasks`]
#[derive(Debug)]
pub struct RelayTasks {
    pub pipeline: JoinHandle<()>,
    pub health: JoinHandle<()>,
    pub broker_events: JoinHandle<()>,
}

impl RelayTasks {
    /// Wait for every task, logging any that panicked
    pub async fn join(self) {
        for (name, handle) in [
            ("pipeline", self.pipeline),
            ("health", self.health),
            ("broker_events", self.broker_events),
        ] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Relay task ended abnormally");
            }
        }
    }
}

impl<T: Transport + 'static> RelayContext<T> {
    pub fn new(config: RelayConfig, transport: Arc<T>) -> Self {
        let buffers = Arc::new(TopicBuffers::new(
            config.buffer.capacity,
            std::time::Duration::from_secs(config.buffer.rate_window_secs),
        ));
        let hub = Arc::new(ClientHub::new(
            &config.server,
            &config.topics,
            config.limits.clone(),
        ));
        let (health, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            transport,
            buffers,
            hub,
            metrics: Arc::new(MetricsCollector::new()),
            health,
            shutdown,
        }
    }

    pub fn pipeline(&self) -> MessagePipeline<T> {
        MessagePipeline::new(
            TopicClassifier::new(self.config.topics.clone(), self.config.limits.clone()),
            self.config.topics.clone(),
            self.buffers.clone(),
            self.hub.clone(),
            self.transport.clone(),
            self.metrics.clone(),
        )
    }

    pub fn health_monitor(&self) -> HealthMonitor<T> {
        HealthMonitor::new(
            self.config.health.clone(),
            self.transport.clone(),
            self.hub.clone(),
            self.metrics.clone(),
            self.health.clone(),
        )
    }

    pub fn latest_health(&self) -> Option<HealthSnapshot> {
        self.health.borrow().clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Subscribe to every configured upstream topic family
    ///
    /// Subscriptions made before the link is up are queued and replayed.
    pub async fn subscribe_upstream(&self) -> Result<(), RelayError> {
        for pattern in self.config.topics.upstream_subscriptions() {
            self.transport
                .subscribe(&pattern, QosLevel::AtLeastOnce)
                .await?;
        }
        Ok(())
    }

    /// Start the pipeline, the health monitor and the broker event forwarder
    pub fn spawn_tasks(&self, inbound: mpsc::Receiver<MessageEnvelope>) -> RelayTasks {
        let pipeline = tokio::spawn(self.pipeline().run(inbound, self.shutdown_signal()));
        let health = tokio::spawn(self.health_monitor().run(self.shutdown_signal()));
        let broker_events = tokio::spawn(forward_broker_events(
            self.transport.clone(),
            self.hub.clone(),
            self.metrics.clone(),
            self.config.health.status_topic.clone(),
            self.transport.broker_events(),
            self.shutdown_signal(),
        ));
        RelayTasks {
            pipeline,
            health,
            broker_events,
        }
    }

    /// Handle one text frame from a session; the reply goes to that session only
    pub async fn handle_client_text(&self, session_id: Uuid, text: &str) {
        let span = session_span!(session_id = %session_id);
        async {
            let reply = match ClientMessage::parse(text) {
                Ok(message) => self.handle_client_message(session_id, message).await,
                Err(e) => Err(RelayError::invalid_request(format!(
                    "unrecognized message: {e}"
                ))),
            };
            let frame = reply.unwrap_or_else(|e| {
                debug!(error = %e, "Client request failed");
                e.to_error_message()
            });
            if let Err(e) = self.hub.send_to(session_id, &frame).await {
                debug!(error = %e, "Reply not delivered");
            }
        }
        .instrument(span)
        .await
    }

    /// Dispatch one decoded client request and build its reply
    pub async fn handle_client_message(
        &self,
        session_id: Uuid,
        message: ClientMessage,
    ) -> Result<WireMessage, RelayError> {
        match message {
            ClientMessage::Subscribe { topic, qos } => {
                self.hub.subscribe(session_id, &topic, qos).await?;
                // Relay-wide and idempotent; never undone by a session
                if topic != ALL_TOPICS {
                    if let Err(e) = self.transport.subscribe(&topic, qos).await {
                        warn!(pattern = %topic, error = %e, "Upstream subscribe failed");
                    }
                }
                Ok(WireMessage::ack("subscribe", &topic))
            }
            ClientMessage::Unsubscribe { topic } => {
                let removed = self.hub.unsubscribe(session_id, &topic).await?;
                Ok(WireMessage::ack("unsubscribe", &topic).with_data(json!({
                    "action": "unsubscribe",
                    "removed": removed,
                })))
            }
            ClientMessage::Publish {
                topic,
                message,
                options,
            } => {
                let receipt = self
                    .hub
                    .relay_publish(
                        self.transport.as_ref(),
                        session_id,
                        &topic,
                        &message,
                        options.unwrap_or_default(),
                    )
                    .await?;
                Ok(WireMessage::ack("publish", &receipt.topic).with_data(json!({
                    "action": "publish",
                    "warnings": receipt.warnings,
                })))
            }
            ClientMessage::GetStatus => {
                let subscriptions = self.hub.subscriptions(session_id).await?;
                Ok(WireMessage::new(WireMessageType::Status).with_data(json!({
                    "connection": self.transport.connection(),
                    "sessionCount": self.hub.session_count().await,
                    "subscriptions": subscriptions,
                    "health": self.latest_health().map(|h| h.status),
                    "bufferedTopics": self.buffers.topics(),
                })))
            }
            ClientMessage::GetHistory { topic, count } => {
                let count = count
                    .unwrap_or(DEFAULT_HISTORY_COUNT)
                    .min(self.buffers.capacity());
                let entries = self.buffers.window(&topic, count);
                Ok(WireMessage::new(WireMessageType::History)
                    .with_topic(&topic)
                    .with_data(json!({
                        "count": entries.len(),
                        "entries": entries,
                        "stats": self.buffers.stats(&topic),
                    })))
            }
            ClientMessage::Reconnect => {
                let outcome = match self.transport.request_reconnect()? {
                    ManualReconnect::Scheduled => "scheduled".to_string(),
                    ManualReconnect::AlreadyConnected => "already_connected".to_string(),
                    ManualReconnect::Refused { reason } => {
                        return Err(RelayError::invalid_request(format!(
                            "reconnect refused: {reason}"
                        )))
                    }
                };
                info!(session_id = %session_id, outcome = %outcome, "Manual reconnect requested");
                Ok(WireMessage::new(WireMessageType::Ack).with_data(json!({
                    "action": "reconnect",
                    "result": outcome,
                })))
            }
            ClientMessage::Ping => Ok(WireMessage::new(WireMessageType::Pong)),
        }
    }

    /// Stop sessions, flush a shutdown status upstream, close everything
    pub async fn shutdown(&self) {
        info!("Relay shutting down");
        self.hub.stop_accepting();

        let notice = WireMessage::new(WireMessageType::Shutdown)
            .with_data(json!({ "reason": "relay shutting down" }));
        self.hub.broadcast_all(&notice).await;

        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Broker shutdown reported an error");
        }

        let _ = self.shutdown.send(true);
        let closed = self.hub.close_all().await;
        for _ in 0..closed {
            self.metrics.session_closed();
        }
        info!(sessions_closed = closed, "Relay stopped");
    }
}

/// Relay broker lifecycle events to sessions and announce reconnects upstream
async fn forward_broker_events<T: Transport + ?Sized>(
    transport: Arc<T>,
    hub: Arc<ClientHub>,
    metrics: Arc<MetricsCollector>,
    status_topic: String,
    mut events: broadcast::Receiver<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Broker event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            BrokerEvent::Connected => {
                metrics.connection_established();
                let status = json!({ "status": "online", "timestamp": Utc::now() });
                if let Ok(payload) = serde_json::to_vec(&status) {
                    let options = PublishOptions {
                        qos: QosLevel::AtLeastOnce,
                        retain: false,
                    };
                    if let Err(e) = transport
                        .publish(&status_topic, Bytes::from(payload), options)
                        .await
                    {
                        debug!(error = %e, "Online status not published");
                    }
                }
            }
            BrokerEvent::Disconnected { .. } => metrics.connection_lost(),
            BrokerEvent::Reconnecting { .. } => metrics.reconnect_attempted(),
            BrokerEvent::Failed { .. } => {}
        }

        if let Ok(data) = serde_json::to_value(&event) {
            let frame = WireMessage::new(WireMessageType::BrokerEvent).with_data(data);
            let report = hub.broadcast_all(&frame).await;
            metrics.broadcast_completed(report.delivered, report.pruned.len());
        }
    }
    debug!("Broker event forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::Value;

    fn context(transport: MockTransport) -> RelayContext<MockTransport> {
        RelayContext::new(RelayConfig::default(), Arc::new(transport))
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let a = context(MockTransport::connected());
        let b = context(MockTransport::connected());
        a.pipeline()
            .process(MessageEnvelope::new(
                "scale/weight",
                Bytes::from_static(b"1.0"),
                QosLevel::AtMostOnce,
            ))
            .await;
        assert_eq!(a.buffers.topics(), vec!["scale/weight".to_string()]);
        assert!(b.buffers.topics().is_empty());
        assert_eq!(b.metrics.snapshot().pipeline.messages_received, 0);
    }

    #[tokio::test]
    async fn test_subscribe_upstream_covers_all_families() {
        let ctx = context(MockTransport::new());
        ctx.subscribe_upstream().await.unwrap();
        let patterns: Vec<String> = ctx
            .transport
            .get_subscriptions()
            .await
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert!(patterns.contains(&"robot/control/#".to_string()));
        assert!(patterns.contains(&"robot/topics".to_string()));
    }

    #[tokio::test]
    async fn test_ping_and_unknown_frame() {
        let ctx = context(MockTransport::connected());
        let mut session = ctx.hub.accept().await.unwrap();
        let _welcome = session.outbound.recv().await;

        ctx.handle_client_text(session.id, r#"{"type":"ping"}"#).await;
        let pong: Value = serde_json::from_str(&session.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");

        ctx.handle_client_text(session.id, "garbage").await;
        let error: Value = serde_json::from_str(&session.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_get_history_returns_buffered_entries() {
        let ctx = context(MockTransport::connected());
        let session = ctx.hub.accept().await.unwrap();
        let mut pipeline = ctx.pipeline();
        for payload in [&b"1.0"[..], b"2.0", b"3.0"] {
            pipeline
                .process(MessageEnvelope::new(
                    "scale/weight",
                    Bytes::copy_from_slice(payload),
                    QosLevel::AtMostOnce,
                ))
                .await;
        }

        let reply = ctx
            .handle_client_message(
                session.id,
                ClientMessage::GetHistory {
                    topic: "scale/weight".into(),
                    count: Some(2),
                },
            )
            .await
            .unwrap();
        let data = reply.data.unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["entries"][0]["normalizedData"]["value"], 2.0);
        assert_eq!(data["entries"][1]["normalizedData"]["value"], 3.0);
    }

    #[tokio::test]
    async fn test_reconnect_refused_when_failed() {
        let transport = MockTransport::new();
        transport.set_phase(crate::transport::ConnectionPhase::Failed {
            reason: "10 consecutive connection failures".into(),
        });
        let ctx = context(transport);
        let session = ctx.hub.accept().await.unwrap();

        let result = ctx
            .handle_client_message(session.id, ClientMessage::Reconnect)
            .await;
        assert!(matches!(result, Err(RelayError::Broker(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_closes_sessions() {
        let ctx = context(MockTransport::connected());
        let mut session = ctx.hub.accept().await.unwrap();
        let _welcome = session.outbound.recv().await;

        ctx.shutdown().await;

        let notice: Value = serde_json::from_str(&session.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(notice["type"], "shutdown");
        assert!(session.outbound.recv().await.is_none());
        assert!(ctx.hub.accept().await.is_err());
        assert!(ctx.is_shutting_down());
        assert!(ctx
            .transport
            .shut_down
            .load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_broker_events_reach_sessions() {
        let transport = MockTransport::new();
        let ctx = context(transport);
        let mut session = ctx.hub.accept().await.unwrap();
        let _welcome = session.outbound.recv().await;
        let (_tx, rx) = mpsc::channel(1);
        let tasks = ctx.spawn_tasks(rx);

        ctx.transport.set_connected(true);

        let frame = loop {
            let text = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                session.outbound.recv(),
            )
            .await
            .unwrap()
            .unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "broker_event" {
                break value;
            }
        };
        assert_eq!(frame["data"]["event"], "connected");

        ctx.shutdown().await;
        tasks.join().await;
    }

    #[tokio::test]
    async fn test_connection_right_after_start_is_announced() {
        let ctx = context(MockTransport::new());
        let (_tx, rx) = mpsc::channel(1);
        let tasks = ctx.spawn_tasks(rx);
        // No yield between starting the tasks and the first ConnAck
        ctx.transport.set_connected(true);

        let mut announced = false;
        for _ in 0..100 {
            let online = ctx
                .transport
                .published_to("system/status")
                .await
                .iter()
                .any(|m| m.json()["status"] == "online");
            if online && ctx.metrics.snapshot().broker.connections_established == 1 {
                announced = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(announced);

        ctx.shutdown().await;
        tasks.join().await;
    }
}
