//! Impure I/O for the broker link
//!
//! [`BrokerConnection`] owns the single upstream session. A background task
//! polls the client event loop, forwards inbound publishes into one ordered
//! channel, replays subscriptions on every ConnAck and drives the
//! [`ReconnectSupervisor`] when the session drops.

use super::connection::{
    classify_failure, configure_mqtt_options, to_mqtt_qos, BrokerError, BrokerEvent,
    ConnectError, ConnectionPhase, ConnectionSnapshot,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::supervisor::{BackoffPolicy, ManualReconnect, ReconnectSupervisor, ReconnectionDecision};
use crate::config::{BrokerSection, RelayConfig};
use crate::protocol::{
    validate_pattern, validate_publish_topic, MessageEnvelope, PublishOptions, QosLevel,
    ALL_TOPICS,
};
use crate::broker_span;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Requests the client may queue before the event loop drains them
const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

type Subscriptions = Arc<Mutex<BTreeMap<String, QosLevel>>>;
type InboundSender = Arc<RwLock<Option<mpsc::Sender<MessageEnvelope>>>>;

/// The relay's single upstream broker session
pub struct BrokerConnection {
    config: BrokerSection,
    policy: BackoffPolicy,
    status_topic: String,
    shutdown_grace: Duration,
    client: Arc<Mutex<AsyncClient>>,
    pending_event_loop: std::sync::Mutex<Option<EventLoop>>,
    state_tx: Arc<watch::Sender<ConnectionSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    reconnect_now: Arc<Notify>,
    subscriptions: Subscriptions,
    inbound: InboundSender,
    events: broadcast::Sender<BrokerEvent>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub fn new(config: &RelayConfig) -> Self {
        let broker = &config.broker;
        let (client, event_loop) =
            AsyncClient::new(configure_mqtt_options(broker), REQUEST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionSnapshot::new(format!(
            "{}:{}",
            broker.host, broker.port
        )));
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config: broker.clone(),
            policy: BackoffPolicy::from_config(&config.reconnect),
            status_topic: config.health.status_topic.clone(),
            shutdown_grace: Duration::from_millis(config.server.shutdown_grace_ms),
            client: Arc::new(Mutex::new(client)),
            pending_event_loop: std::sync::Mutex::new(Some(event_loop)),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            closing: Arc::new(AtomicBool::new(false)),
            reconnect_now: Arc::new(Notify::new()),
            subscriptions: Arc::new(Mutex::new(BTreeMap::new())),
            inbound: Arc::new(RwLock::new(None)),
            events,
            event_loop_handle: std::sync::Mutex::new(None),
        }
    }

    /// Register the single inbound message channel
    ///
    /// Messages for one topic arrive on it in broker order.
    pub fn set_message_sender(&self, sender: mpsc::Sender<MessageEnvelope>) {
        let mut guard = self.inbound.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sender);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Start the event loop and wait for the first attempt's outcome
    ///
    /// The supervisor keeps retrying in the background when the first attempt
    /// fails, so an error here is not fatal to the relay.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let event_loop = self
            .pending_event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(event_loop) = event_loop else {
            // Already started; report the current outcome
            let snapshot = self.state_tx.borrow().clone();
            return match snapshot.last_error {
                Some(err) if !snapshot.connected => Err(err),
                _ => Ok(()),
            };
        };

        let state_rx = self.state_tx.subscribe();
        let task = EventLoopTask {
            config: self.config.clone(),
            supervisor: ReconnectSupervisor::new(self.policy.clone()),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            closing: self.closing.clone(),
            reconnect_now: self.reconnect_now.clone(),
            subscriptions: self.subscriptions.clone(),
            inbound: self.inbound.clone(),
            events: self.events.clone(),
        };

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            tls = self.config.tls,
            "Starting broker event loop"
        );
        let span = broker_span!(broker = %format!("{}:{}", self.config.host, self.config.port));
        let handle = tokio::spawn(task.run(event_loop).instrument(span));
        *self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Self::wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .await
    }

    /// Wait until the first attempt either gets a ConnAck or fails
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionSnapshot>,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                {
                    let snapshot = state_rx.borrow_and_update();
                    if snapshot.connected {
                        return Ok(());
                    }
                    if let Some(err) = &snapshot.last_error {
                        return Err(err.clone());
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectError::Network("connection state closed".to_string()));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Network(format!(
                "no ConnAck within {}s",
                timeout.as_secs()
            ))),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Patterns that will be (re)issued on every ConnAck
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        let snapshot = self.state_tx.borrow();
        if snapshot.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected {
                phase: snapshot.phase.label().to_string(),
            })
        }
    }

    pub async fn subscribe(&self, pattern: &str, qos: QosLevel) -> Result<(), BrokerError> {
        // Downstream shorthand for every topic
        let pattern = if pattern == ALL_TOPICS { "#" } else { pattern };
        validate_pattern(pattern).map_err(|source| BrokerError::InvalidTopic {
            topic: pattern.to_string(),
            source,
        })?;

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.get(pattern) == Some(&qos) {
            trace!(pattern = %pattern, "Already subscribed");
            return Ok(());
        }
        subscriptions.insert(pattern.to_string(), qos);

        if !self.state_tx.borrow().connected {
            debug!(pattern = %pattern, "Subscription queued until connected");
            return Ok(());
        }

        let client = self.client.lock().await;
        client
            .subscribe(pattern, to_mqtt_qos(qos))
            .await
            .map_err(|e| BrokerError::SubscribeFailed {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        info!(pattern = %pattern, qos = u8::from(qos), "Subscribed upstream");
        Ok(())
    }

    /// Publish without buffering; fails fast when the link is down
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        self.check_connected()?;
        validate_publish_topic(topic).map_err(|source| BrokerError::InvalidTopic {
            topic: topic.to_string(),
            source,
        })?;

        let client = self.client.lock().await;
        client
            .try_publish(topic, to_mqtt_qos(options.qos), options.retain, payload)
            .map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        trace!(topic = %topic, retain = options.retain, "Published upstream");
        Ok(())
    }

    /// Cut a pending backoff wait short
    pub fn request_reconnect(&self) -> Result<ManualReconnect, BrokerError> {
        let phase = self.state_tx.borrow().phase.clone();
        match phase {
            ConnectionPhase::Failed { reason } => Err(BrokerError::SupervisorFailed(reason)),
            ConnectionPhase::Connected => Ok(ManualReconnect::AlreadyConnected),
            ConnectionPhase::Reconnecting { attempt } => {
                info!(attempt, "Manual reconnect requested, skipping backoff");
                // Only a backoff wait already in progress is woken; no permit is kept
                self.reconnect_now.notify_waiters();
                Ok(ManualReconnect::Scheduled)
            }
            ConnectionPhase::Idle | ConnectionPhase::Connecting => Ok(ManualReconnect::Scheduled),
        }
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        self.state_tx.send_modify(|s| s.last_heartbeat = Some(at));
    }

    /// Flush a shutdown status, wait the grace period, then close the session
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);

        if self.state_tx.borrow().connected {
            let status = serde_json::json!({
                "status": "shutting_down",
                "client_id": self.config.client_id,
                "timestamp": Utc::now(),
            });
            let payload = serde_json::to_vec(&status)?;
            if let Err(e) = self
                .publish(
                    &self.status_topic,
                    Bytes::from(payload),
                    PublishOptions {
                        qos: QosLevel::AtLeastOnce,
                        retain: false,
                    },
                )
                .await
            {
                warn!(error = %e, "Failed to publish shutdown status");
            }
            if let Err(e) = self.client.lock().await.try_disconnect() {
                debug!(error = %e, "Disconnect request not queued");
            }
        }

        tokio::time::sleep(self.shutdown_grace).await;
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => debug!("Broker event loop stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Broker event loop ended with error"),
                Err(_) => {
                    warn!("Broker event loop did not stop in time, aborting");
                    handle.abort();
                }
                _ => {}
            }
        }

        self.state_tx.send_modify(|s| s.set_phase(ConnectionPhase::Idle));
        info!("Broker connection closed");
        Ok(())
    }
}

/// State moved into the background event-loop task
struct EventLoopTask {
    config: BrokerSection,
    supervisor: ReconnectSupervisor,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: Arc<watch::Sender<ConnectionSnapshot>>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    reconnect_now: Arc<Notify>,
    subscriptions: Subscriptions,
    inbound: InboundSender,
    events: broadcast::Sender<BrokerEvent>,
}

enum Polled {
    Shutdown,
    Event(Result<rumqttc::v5::Event, rumqttc::v5::ConnectionError>),
}

impl EventLoopTask {
    async fn run(mut self, mut event_loop: EventLoop) {
        self.supervisor.begin_attempt();
        self.publish_phase();

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        Polled::Shutdown
                    } else {
                        continue;
                    }
                }
                result = event_loop.poll() => Polled::Event(result),
            };

            let keep_running = match polled {
                Polled::Shutdown => false,
                Polled::Event(Ok(event)) => {
                    self.handle_route(MessageHandler::route_event(&event), &mut event_loop)
                        .await
                }
                Polled::Event(Err(e)) => self.handle_error(e, &mut event_loop).await,
            };
            if !keep_running {
                break;
            }
        }
        info!("Broker event loop stopped");
    }

    /// Returns false when the loop should stop
    async fn handle_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.supervisor.on_connected();
                self.state_tx.send_modify(|s| {
                    s.set_phase(ConnectionPhase::Connected);
                    s.attempt = 0;
                    s.failures = 0;
                    s.last_error = None;
                });
                info!(host = %self.config.host, port = self.config.port, "Connected to broker");
                let _ = self.events.send(BrokerEvent::Connected);
                self.resubscribe().await;
                true
            }
            EventRoute::MessageReceived { envelope, retain } => {
                trace!(topic = %envelope.topic, retain, "Inbound message");
                let sender = self
                    .inbound
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let delivered = match sender {
                    Some(sender) => offer_inbound(&sender, envelope),
                    None => {
                        warn!(topic = %envelope.topic, "No inbound handler registered, message dropped");
                        false
                    }
                };
                if !delivered {
                    self.state_tx.send_modify(|s| s.inbound_dropped += 1);
                }
                true
            }
            EventRoute::Disconnected { reason } => {
                if self.closing.load(Ordering::SeqCst) {
                    return false;
                }
                let _ = self.events.send(BrokerEvent::Disconnected {
                    reason: reason.clone(),
                });
                let decision = self.supervisor.on_connection_lost(&reason);
                self.carry_out(decision, event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id, codes } => {
                if MessageHandler::subscription_refused(&codes) {
                    warn!(packet_id, codes = ?codes, "Broker refused subscription");
                } else {
                    debug!(packet_id, codes = ?codes, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(event = %event, "Broker event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_error(
        &mut self,
        error: rumqttc::v5::ConnectionError,
        event_loop: &mut EventLoop,
    ) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }
        let failure = classify_failure(&error.to_string());
        let was_connected = self.supervisor.phase().is_connected();
        self.state_tx
            .send_modify(|s| s.last_error = Some(failure.clone()));

        let decision = if was_connected {
            let _ = self.events.send(BrokerEvent::Disconnected {
                reason: failure.to_string(),
            });
            self.supervisor.on_connection_lost(&failure.to_string())
        } else {
            error!(error = %failure, "Broker connection attempt failed");
            self.supervisor.on_attempt_failed(&failure.to_string())
        };
        self.carry_out(decision, event_loop).await
    }

    async fn carry_out(&mut self, decision: ReconnectionDecision, event_loop: &mut EventLoop) -> bool {
        match decision {
            ReconnectionDecision::Retry { attempt, delay } => {
                self.publish_phase();
                let delay_ms = delay.as_millis() as u64;
                info!(
                    attempt,
                    max_attempts = self.supervisor.policy().max_attempts,
                    delay_ms,
                    "Scheduling broker reconnection"
                );
                let _ = self.events.send(BrokerEvent::Reconnecting { attempt, delay_ms });

                if !self.interruptible_sleep(delay).await {
                    return false;
                }
                self.supervisor.begin_attempt();
                self.publish_phase();
                self.apply_new_connection(event_loop).await;
                true
            }
            ReconnectionDecision::GiveUp { reason } => {
                self.publish_phase();
                let _ = self.events.send(BrokerEvent::Failed { reason });
                false
            }
            ReconnectionDecision::Continue => true,
        }
    }

    /// Sleep for the backoff delay unless shutdown or a manual reconnect
    /// interrupts it; returns false on shutdown
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    info!("Shutdown requested during reconnection delay");
                    return false;
                }
                true
            }
            _ = self.reconnect_now.notified() => {
                debug!("Backoff interrupted by manual reconnect");
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Replace the client and event loop with a fresh pair
    async fn apply_new_connection(&mut self, event_loop: &mut EventLoop) {
        let (client, new_event_loop) =
            AsyncClient::new(configure_mqtt_options(&self.config), REQUEST_CAPACITY);
        *event_loop = new_event_loop;
        *self.client.lock().await = client;
        debug!("Created new broker session for reconnection attempt");
    }

    /// Re-issue every known subscription after a ConnAck
    async fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().await;
        let client = self.client.lock().await;
        for (pattern, qos) in subscriptions.iter() {
            // The event loop is this task, so never wait on the request queue here
            match client.try_subscribe(pattern.as_str(), to_mqtt_qos(*qos)) {
                Ok(()) => debug!(pattern = %pattern, "Re-subscribed"),
                Err(e) => error!(pattern = %pattern, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    /// Mirror the supervisor into the shared connection record
    fn publish_phase(&self) {
        let phase = self.supervisor.phase().clone();
        let attempt = self.supervisor.attempt();
        let failures = self.supervisor.failures();
        self.state_tx.send_modify(|s| {
            s.set_phase(phase);
            s.attempt = attempt;
            s.failures = failures;
        });
    }
}

#[async_trait]
impl Transport for BrokerConnection {
    async fn subscribe(&self, pattern: &str, qos: QosLevel) -> Result<(), BrokerError> {
        BrokerConnection::subscribe(self, pattern, qos).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        BrokerConnection::publish(self, topic, payload, options).await
    }

    fn connection(&self) -> ConnectionSnapshot {
        self.state_tx.borrow().clone()
    }

    fn request_reconnect(&self) -> Result<ManualReconnect, BrokerError> {
        BrokerConnection::request_reconnect(self)
    }

    fn record_heartbeat(&self, at: DateTime<Utc>) {
        BrokerConnection::record_heartbeat(self, at)
    }

    fn broker_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events()
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        BrokerConnection::shutdown(self).await
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Hand one publish to the pipeline without stalling the event loop
///
/// Keep-alives and acks are serviced by the same loop, so a full queue drops
/// the message instead of waiting. Returns false when nothing was queued.
fn offer_inbound(sender: &mpsc::Sender<MessageEnvelope>, envelope: MessageEnvelope) -> bool {
    match sender.try_send(envelope) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(envelope)) => {
            warn!(topic = %envelope.topic, "Inbound queue full, message dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(envelope)) => {
            warn!(topic = %envelope.topic, "Inbound channel closed, message dropped");
            false
        }
    }
}
