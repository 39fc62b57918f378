//! Mock implementations for testing
//!
//! Provides a scripted [`Transport`] and a recording [`Progress`] sink so
//! whole OTA sessions can run without a broker.

use crate::progress::{Progress, ProgressView};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Mock transport failure: {0}")]
pub struct MockTransportError(pub String);

/// One call made against the mock, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect,
    Subscribe(String),
    Publish { topic: String, bytes: usize },
    Disconnect,
}

/// Everything the mock was asked to do
#[derive(Debug, Default)]
pub struct TransportLog {
    pub calls: Vec<TransportCall>,
    pub subscriptions: Vec<String>,
    pub publishes: Vec<(String, Bytes)>,
    pub disconnects: usize,
}

impl TransportLog {
    pub fn publish_count(&self) -> usize {
        self.publishes.len()
    }

    pub fn was_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|t| t == topic)
    }
}

/// Mock transport replaying a fixed script of events
///
/// Once the script is exhausted `next_event` never resolves, which leaves
/// timeouts and cancellation to end the session.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: VecDeque<TransportEvent>,
    log: Arc<Mutex<TransportLog>>,
    connected: bool,
    closed: bool,
    fail_connect: bool,
    fail_publish: bool,
    /// Close (yield `None`) instead of hanging when the script runs out
    close_when_drained: bool,
}

impl MockTransport {
    pub fn new(script: Vec<TransportEvent>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_publish(mut self) -> Self {
        self.fail_publish = true;
        self
    }

    pub fn closing_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }

    /// Shared handle to the call log, valid after the mock is moved
    pub fn log(&self) -> Arc<Mutex<TransportLog>> {
        self.log.clone()
    }

    fn record(&self, call: TransportCall) {
        if let Ok(mut log) = self.log.lock() {
            log.calls.push(call);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.record(TransportCall::Connect);
        if self.fail_connect {
            return Err(MockTransportError("connection refused".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.record(TransportCall::Subscribe(topic.to_string()));
        if let Ok(mut log) = self.log.lock() {
            log.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), Self::Error> {
        self.record(TransportCall::Publish {
            topic: topic.to_string(),
            bytes: payload.len(),
        });
        if self.fail_publish {
            return Err(MockTransportError("publish rejected".to_string()));
        }
        if let Ok(mut log) = self.log.lock() {
            log.publishes.push((topic.to_string(), payload));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.record(TransportCall::Disconnect);
        if let Ok(mut log) = self.log.lock() {
            log.disconnects += 1;
        }
        self.connected = false;
        self.closed = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        match self.script.pop_front() {
            Some(event) => {
                match &event {
                    TransportEvent::Connected => self.connected = true,
                    TransportEvent::ConnectionRefused(_) | TransportEvent::ConnectionLost(_) => {
                        self.connected = false
                    }
                    TransportEvent::Reconnecting { .. } => self.connected = false,
                    TransportEvent::Message { .. } => {}
                }
                Some(event)
            }
            None if self.close_when_drained => None,
            None => std::future::pending().await,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Progress sink that keeps everything it is shown
#[derive(Debug, Default, Clone)]
pub struct RecordingProgress {
    transfers: Arc<Mutex<Vec<ProgressView>>>,
    notices: Arc<Mutex<Vec<String>>>,
}

impl RecordingProgress {
    pub fn transfers(&self) -> Arc<Mutex<Vec<ProgressView>>> {
        self.transfers.clone()
    }

    pub fn notices(&self) -> Arc<Mutex<Vec<String>>> {
        self.notices.clone()
    }
}

impl Progress for RecordingProgress {
    fn report_transfer(&mut self, view: &ProgressView) {
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.push(*view);
        }
    }

    fn report_notice(&mut self, notice: &str) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice.to_string());
        }
    }
}
