//! Impure I/O operations for MQTT client
//!
//! This module handles all impure I/O operations including network communication,
//! reconnection backoff and integration with the rumqttc client. The rumqttc
//! event loop is polled from [`Transport::next_event`], so the whole session
//! runs on the caller's task.

use super::connection::{
    build_client_id, configure_mqtt_options, ensure_publish_fits, ConnectionState, MqttError,
    ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::error::sanitize_error_message;
use crate::mqtt_span;
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop};
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Request channel capacity between `AsyncClient` and `EventLoop`
const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// How long `disconnect` keeps polling to flush queued packets
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT 3.1.1 transport for talking to a Homie device through a broker
pub struct MqttClient {
    client_id: String,
    client: AsyncClient,
    event_loop: EventLoop,
    state: ConnectionState,
    reconnect_config: ReconnectConfig,
    reconnect_attempts: u32,
    pending_backoff: Option<Duration>,
    ever_connected: bool,
    closed: bool,
    max_packet_size: usize,
}

impl MqttClient {
    pub fn new(config: &MqttSection) -> Result<Self, MqttError> {
        let client_id = build_client_id(&config.client_id_prefix);
        let mqtt_options = configure_mqtt_options(&client_id, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let reconnect_config = ReconnectConfig::from(&config.reconnect);

        match reconnect_config.calculate_max_total_time() {
            Some(total_ms) => debug!(
                client_id = %client_id,
                "Reconnection gives up after {}ms of backoff", total_ms
            ),
            None => debug!(client_id = %client_id, "Reconnection retries without limit"),
        }

        Ok(MqttClient {
            client_id,
            client,
            event_loop,
            state: ConnectionState::Idle,
            reconnect_config,
            reconnect_attempts: 0,
            pending_backoff: None,
            ever_connected: false,
            closed: false,
            max_packet_size: config.max_packet_size,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(self.state, ConnectionState::PermanentlyDisconnected(_))
    }

    fn apply(&mut self, event: ConnectionEvent) {
        self.state = HealthMonitor::determine_next_state(&self.state, event);
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        if !HealthMonitor::can_publish(&self.state) {
            return Err(MqttError::NotConnected {
                state: self.state.clone(),
            });
        }
        Ok(())
    }

    /// Decide what a poll error means for the session
    fn handle_connection_error(&mut self, reason: String) -> TransportEvent {
        let reason = sanitize_error_message(&reason);

        // Before the first ConnAck there is nothing to recover
        if !self.ever_connected {
            error!(client_id = %self.client_id, "MQTT connection failed: {}", reason);
            self.apply(ConnectionEvent::PermanentFailure(reason.clone()));
            self.closed = true;
            return TransportEvent::ConnectionRefused(reason);
        }

        self.apply(ConnectionEvent::NetworkError(reason.clone()));

        match HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
        ) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.apply(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                self.pending_backoff = Some(Duration::from_millis(delay_ms));
                TransportEvent::Reconnecting { attempt }
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "{reason} (max reconnection attempts ({}) exceeded)",
                    self.reconnect_attempts
                );
                self.apply(ConnectionEvent::PermanentFailure(reason.clone()));
                self.closed = true;
                TransportEvent::ConnectionLost(reason)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    /// rumqttc dials lazily on the first poll, so this only arms the state
    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Err(MqttError::NotConnected {
                state: self.state.clone(),
            });
        }
        info!(client_id = %self.client_id, "Connecting to MQTT broker");
        self.apply(ConnectionEvent::ConnectRequested);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let qos = MessageHandler::determine_qos_level(false);
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", "Subscribed to: {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), Self::Error> {
        ensure_publish_fits(topic, payload.len(), self.max_packet_size)?;

        self.check_connection_state()?;

        let qos = MessageHandler::determine_qos_level(true);
        let bytes = payload.len();
        self.client
            .publish_bytes(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", topic = %topic, bytes, "Queued publish");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }

        if HealthMonitor::can_publish(&self.state) {
            self.client
                .disconnect()
                .await
                .map_err(|e| MqttError::DisconnectFailed(Box::new(e)))?;

            // Keep polling so queued publishes reach the socket ahead of DISCONNECT
            let span = mqtt_span!(client_id = %self.client_id, operation = "disconnect");
            let event_loop = &mut self.event_loop;
            let flush = async {
                loop {
                    match event_loop.poll().await {
                        Ok(event) => {
                            if MessageHandler::route_mqtt_event(&event) == EventRoute::DisconnectSent
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(target: "mqtt_transport", "Event loop closed during disconnect: {}", e);
                            break;
                        }
                    }
                }
            };

            if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush.instrument(span))
                .await
                .is_err()
            {
                warn!("Timed out flushing MQTT packets before disconnect");
            }
        }

        self.apply(ConnectionEvent::ClientDisconnected);
        self.closed = true;
        info!(client_id = %self.client_id, "Disconnected from MQTT broker");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if self.closed {
                return None;
            }

            // Cleared only after the sleep so a cancelled call keeps its backoff
            if let Some(delay) = self.pending_backoff {
                tokio::time::sleep(delay).await;
                self.pending_backoff = None;
            }

            let event = match self.event_loop.poll().await {
                Ok(event) => event,
                Err(e) => return Some(self.handle_connection_error(e.to_string())),
            };

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged { session_present } => {
                    debug!(target: "mqtt_transport", session_present, "ConnAck received");
                    self.apply(ConnectionEvent::ConnAckReceived);
                    self.ever_connected = true;
                    self.reconnect_attempts = 0;
                    return Some(TransportEvent::Connected);
                }
                EventRoute::ConnectionRejected(code) => {
                    return Some(
                        self.handle_connection_error(format!("Broker refused connection: {code}")),
                    );
                }
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                } => {
                    debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                    return Some(TransportEvent::Message {
                        topic,
                        payload,
                        retained: retain,
                    });
                }
                EventRoute::Disconnected => {
                    return Some(
                        self.handle_connection_error("Broker sent DISCONNECT".to_string()),
                    );
                }
                EventRoute::SubscriptionConfirmed { return_codes, .. } => {
                    if let Err(e) = MessageHandler::validate_subscription_success(&return_codes) {
                        warn!("{}", e);
                    }
                }
                EventRoute::InfrastructureEvent(event_str) => {
                    tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                }
                EventRoute::DisconnectSent | EventRoute::OutgoingEvent => {}
            }
        }
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state)
    }
}
