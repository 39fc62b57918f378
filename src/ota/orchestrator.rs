//! Drives an [`OtaMachine`] over a [`Transport`]
//!
//! The orchestrator owns the transport and the session for one update. It
//! pulls transport events, translates them into [`OtaEvent`]s, feeds them to
//! the state machine and executes the returned [`Effect`]s. Deadlines and
//! operator cancellation are raced against the transport in the same
//! `select!`, so everything happens on the caller's task.

use super::outcome::{AbortReason, Outcome};
use super::session::{RemoteFirmware, Session};
use super::state_machine::{Effect, OtaEvent, OtaMachine, OtaState};
use crate::config::OtaSection;
use crate::error::sanitize_error_message;
use crate::firmware::FirmwareMetadata;
use crate::progress::{NoOpProgress, Progress};
use crate::protocol::DeviceMessage;
use crate::session_span;
use crate::transport::{Transport, TransportEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// Timing knobs for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// How long to wait for the device to report `ready`, and again for its
    /// OTA info once it has
    pub online_timeout: Duration,
    /// How long to wait for the device to confirm the new firmware; `None`
    /// waits indefinitely
    pub confirmation_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&OtaSection::default())
    }
}

impl From<&OtaSection> for RunOptions {
    fn from(section: &OtaSection) -> Self {
        Self {
            online_timeout: section.online_timeout(),
            confirmation_timeout: section.confirmation_timeout(),
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct OtaReport {
    pub device_id: String,
    pub checksum: String,
    pub firmware: Option<FirmwareMetadata>,
    /// Checksum the device reported before the update
    pub previous_checksum: Option<String>,
    pub remote_firmware: RemoteFirmware,
    pub outcome: Outcome,
    /// The push was attempted; the transport may still have refused it
    pub published: bool,
    /// Non-zero only once the transport accepted the image
    pub bytes_published: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OtaReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

impl fmt::Display for OtaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Succeeded => write!(f, "Device back online. Update Successful!"),
            Outcome::UpToDate => write!(
                f,
                "Device firmware already up to date with md5 checksum: {}",
                self.checksum
            ),
            Outcome::Aborted(reason) => write!(f, "Update aborted: {reason}"),
            Outcome::Failed(reason) => write!(f, "Update failed: {reason}"),
        }
    }
}

/// Runs one OTA session to completion
pub struct OtaOrchestrator<T: Transport> {
    transport: T,
    machine: OtaMachine,
    options: RunOptions,
    progress: Box<dyn Progress>,
    /// Events produced by executing effects, handled before the next poll
    pending: VecDeque<OtaEvent>,
    deadline: Option<Instant>,
    bytes_published: usize,
}

impl<T: Transport> OtaOrchestrator<T> {
    pub fn new(transport: T, session: Session, options: RunOptions) -> Self {
        Self {
            transport,
            machine: OtaMachine::new(session),
            options,
            progress: Box::new(NoOpProgress),
            pending: VecDeque::new(),
            deadline: None,
            bytes_published: 0,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> OtaState {
        self.machine.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until the session reaches a terminal state or `cancel` resolves
    pub async fn run<C>(mut self, cancel: C) -> OtaReport
    where
        C: Future<Output = ()> + Send,
    {
        let started_at = Utc::now();
        let span = session_span!(
            device_id = %self.machine.session().device_id(),
            checksum = %self.machine.session().checksum()
        );

        self.drive(cancel).instrument(span).await;
        self.report(started_at)
    }

    async fn drive<C>(&mut self, cancel: C)
    where
        C: Future<Output = ()> + Send,
    {
        tokio::pin!(cancel);
        let mut cancelled = false;

        self.deadline = Some(Instant::now() + self.options.online_timeout);
        self.dispatch(OtaEvent::Start).await;

        while !self.machine.state().is_terminal() {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => {
                    let deadline = self.deadline;
                    tokio::select! {
                        _ = &mut cancel, if !cancelled => {
                            cancelled = true;
                            info!("Interrupted by operator");
                            OtaEvent::Cancelled
                        }
                        _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                            OtaEvent::Timeout
                        }
                        next = self.transport.next_event() => match self.translate(next) {
                            Some(event) => event,
                            None => continue,
                        },
                    }
                }
            };
            self.dispatch(event).await;
        }
    }

    /// Map a transport event to a state machine input; `None` means ignore
    fn translate(&self, event: Option<TransportEvent>) -> Option<OtaEvent> {
        let Some(event) = event else {
            return Some(OtaEvent::ConnectionLost("transport closed".to_string()));
        };

        match event {
            TransportEvent::Connected => Some(OtaEvent::Connected),
            TransportEvent::ConnectionRefused(reason) => Some(OtaEvent::ConnectionRefused(reason)),
            TransportEvent::ConnectionLost(reason) => Some(OtaEvent::ConnectionLost(reason)),
            TransportEvent::Reconnecting { attempt } => {
                warn!(attempt, "MQTT connection dropped, reconnecting");
                None
            }
            TransportEvent::Message {
                topic,
                payload,
                retained,
            } => {
                let Some(relative) = self.machine.session().topics().relative(&topic) else {
                    debug!(topic = %topic, "Message outside the device tree, ignoring");
                    return None;
                };
                match DeviceMessage::parse(relative, &payload) {
                    Ok(Some(message)) => Some(OtaEvent::Message { message, retained }),
                    Ok(None) => {
                        debug!(topic = %topic, "Unhandled device topic, ignoring");
                        None
                    }
                    Err(e) => Some(OtaEvent::ProtocolViolation(e)),
                }
            }
        }
    }

    async fn dispatch(&mut self, event: OtaEvent) {
        let before = self.machine.state();
        let effects = self.machine.handle(event);
        let after = self.machine.state();

        if before != after {
            self.arm_deadline(after);
        }

        for effect in effects {
            self.execute(effect).await;
        }
    }

    /// Each waiting phase gets its own window
    fn arm_deadline(&mut self, state: OtaState) {
        match state {
            OtaState::AwaitingDeviceInfo => {
                self.deadline = Some(Instant::now() + self.options.online_timeout);
            }
            OtaState::Publishing => {
                self.deadline = self
                    .options
                    .confirmation_timeout
                    .map(|timeout| Instant::now() + timeout);
            }
            state if state.is_terminal() => self.deadline = None,
            _ => {}
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Connect => {
                if let Err(e) = self.transport.connect().await {
                    self.pending.push_back(OtaEvent::ConnectionRefused(
                        sanitize_error_message(&e.to_string()),
                    ));
                }
            }
            Effect::Subscribe(topics) => {
                for topic in topics {
                    if let Err(e) = self.transport.subscribe(&topic).await {
                        // A missing subscription surfaces as a timeout
                        error!(topic = %topic, error = %e, "Failed to subscribe");
                    }
                }
            }
            Effect::Publish { topic, payload } => {
                let bytes = payload.len();
                match self.transport.publish(&topic, payload).await {
                    Ok(()) => {
                        self.bytes_published = bytes;
                        self.pending.push_back(OtaEvent::PublishCompleted);
                    }
                    Err(e) => {
                        self.pending.push_back(OtaEvent::PublishFailed(sanitize_error_message(
                            &e.to_string(),
                        )));
                    }
                }
            }
            Effect::ReportProgress(view) => self.progress.report_transfer(&view),
            Effect::Notify(notice) => {
                info!("{}", notice);
                self.progress.report_notice(&notice);
            }
            Effect::Disconnect => {
                if let Err(e) = self.transport.disconnect().await {
                    warn!(error = %e, "Disconnect failed");
                }
            }
        }
    }

    fn report(self, started_at: DateTime<Utc>) -> OtaReport {
        let session = self.machine.into_session();
        let outcome = session.outcome().cloned().unwrap_or_else(|| {
            Outcome::Aborted(AbortReason::ProtocolError(
                "session ended without an outcome".to_string(),
            ))
        });

        OtaReport {
            device_id: session.device_id().to_string(),
            checksum: session.checksum().to_string(),
            firmware: session.metadata().cloned(),
            previous_checksum: session.remote_old_checksum().map(str::to_string),
            remote_firmware: session.remote_firmware().clone(),
            outcome,
            published: session.published(),
            bytes_published: self.bytes_published,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
