//! Inbound message pipeline
//!
//! One task owns the classifier and handles broker messages strictly in
//! arrival order: classify, append to the ring buffer, fan out to sessions,
//! then publish the processed form upstream. Upstream publishes are best
//! effort; a down broker link never stalls local delivery.

use super::classifier::TopicClassifier;
use super::result::{Category, ClassifiedResult};
use crate::buffer::TopicBuffers;
use crate::config::TopicsSection;
use crate::error::RelayError;
use crate::hub::{BroadcastReport, ClientHub};
use crate::observability::MetricsCollector;
use crate::protocol::{MessageEnvelope, PublishOptions, QosLevel, WireMessage, WireMessageType};
use crate::relay_span;
use crate::transport::{BrokerError, Transport};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// What processing one envelope did
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub result: ClassifiedResult,
    pub report: BroadcastReport,
    /// Upstream topics successfully published to
    pub published: Vec<String>,
    pub emergency_broadcast: bool,
}

pub struct MessagePipeline<T: Transport> {
    classifier: TopicClassifier,
    topics: TopicsSection,
    buffers: Arc<TopicBuffers<ClassifiedResult>>,
    hub: Arc<ClientHub>,
    transport: Arc<T>,
    metrics: Arc<MetricsCollector>,
}

impl<T: Transport> MessagePipeline<T> {
    pub fn new(
        classifier: TopicClassifier,
        topics: TopicsSection,
        buffers: Arc<TopicBuffers<ClassifiedResult>>,
        hub: Arc<ClientHub>,
        transport: Arc<T>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            classifier,
            topics,
            buffers,
            hub,
            transport,
            metrics,
        }
    }

    /// Drain inbound messages until the channel closes or shutdown is signalled
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<MessageEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Message pipeline started");
        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => {
                        self.process(envelope).await;
                    }
                    None => {
                        debug!("Inbound channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Message pipeline stopped");
    }

    /// Process one envelope end to end
    pub async fn process(&mut self, envelope: MessageEnvelope) -> PipelineOutcome {
        let span = relay_span!(topic = %envelope.topic);
        self.process_inner(envelope).instrument(span).await
    }

    async fn process_inner(&mut self, envelope: MessageEnvelope) -> PipelineOutcome {
        self.metrics.message_received();
        let started = Instant::now();
        let result = self.classifier.classify(&envelope);
        self.metrics.message_classified(
            result.category,
            result.validation.is_accepted(),
            started.elapsed(),
        );

        // Rejected results are kept and delivered too, so observers see the failure
        self.buffers.append_at(&result.topic, result.clone(), result.timestamp);

        let report = self.hub.broadcast(&result).await;
        self.metrics
            .broadcast_completed(report.delivered, report.pruned.len());

        let mut published = Vec::new();
        if let Some((topic, payload)) = self.processed_output(&result) {
            if self.publish(&topic, payload, QosLevel::AtMostOnce).await {
                published.push(topic);
            }
        }

        let mut emergency_broadcast = false;
        if let Some(signal) = &result.emergency {
            self.metrics.emergency_detected();
            let condition = RelayError::emergency(&result.topic, signal);
            error!(
                error = %condition,
                source = ?signal.source,
                "Emergency condition detected, broadcasting stop"
            );

            let notice = json!({
                "trigger": result.topic,
                "keyword": signal.keyword,
                "source": signal.source,
                "category": result.category,
                "severity": "critical",
                "action": "immediate_stop",
                "timestamp": result.timestamp,
            });
            let stop = WireMessage::new(WireMessageType::EmergencyStop)
                .with_topic(&self.topics.emergency)
                .with_data(notice.clone());
            let stop_report = self.hub.broadcast_all(&stop).await;
            self.metrics
                .broadcast_completed(stop_report.delivered, stop_report.pruned.len());
            emergency_broadcast = true;

            let emergency_topic = self.topics.emergency.clone();
            if self
                .publish(&emergency_topic, notice, QosLevel::AtLeastOnce)
                .await
            {
                published.push(emergency_topic);
            }
        }

        PipelineOutcome {
            result,
            report,
            published,
            emergency_broadcast,
        }
    }

    /// Upstream topic and payload for the processed form of a result
    fn processed_output(&self, result: &ClassifiedResult) -> Option<(String, Value)> {
        match result.category {
            Category::Weight if result.validation.is_accepted() => Some((
                self.topics.processed_weight.clone(),
                result.normalized_data.clone(),
            )),
            Category::Concentration if result.validation.is_accepted() => Some((
                self.topics.processed_concentration.clone(),
                result.normalized_data.clone(),
            )),
            Category::RobotControl => {
                let command = result.normalized_data["command"]
                    .as_str()
                    .unwrap_or("unknown");
                let topic = format!(
                    "{}/{}",
                    self.topics.command_response_prefix.trim_end_matches('/'),
                    command
                );
                let mut response = json!({
                    "source_topic": result.topic,
                    "validation": result.validation,
                    "timestamp": result.timestamp,
                });
                if let (Value::Object(target), Value::Object(fields)) =
                    (&mut response, &result.normalized_data)
                {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
                Some((topic, response))
            }
            _ => None,
        }
    }

    /// Best-effort publish; returns whether it went out
    async fn publish(&self, topic: &str, payload: Value, qos: QosLevel) -> bool {
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to serialize processed payload");
                return false;
            }
        };
        let options = PublishOptions { qos, retain: false };
        match self.transport.publish(topic, bytes, options).await {
            Ok(()) => {
                self.metrics.publish_succeeded();
                true
            }
            Err(BrokerError::NotConnected { phase }) => {
                self.metrics.publish_failed();
                debug!(topic = %topic, phase = %phase, "Skipped publish while disconnected");
                false
            }
            Err(e) => {
                self.metrics.publish_failed();
                warn!(topic = %topic, error = %e, "Processed publish failed");
                false
            }
        }
    }
}
