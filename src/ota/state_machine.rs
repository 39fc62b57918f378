//! OTA update state machine
//!
//! [`transition`] is the single place where session state changes. It takes
//! the current [`OtaState`] and an [`OtaEvent`], mutates the [`Session`] and
//! returns the next state together with the [`Effect`]s the driver must
//! perform. It does no I/O, so every transition can be exercised without a
//! broker.

use super::outcome::{AbortReason, FailureReason, Outcome};
use super::session::Session;
use crate::progress::ProgressView;
use crate::protocol::{DeviceMessage, DeviceState, OtaStatus, ProtocolError, StatusCode};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Lifecycle of one update session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Disconnected,
    Connecting,
    AwaitingDeviceOnline,
    AwaitingDeviceInfo,
    Publishing,
    AwaitingConfirmation,
    UpToDate,
    Aborted,
    Succeeded,
    Failed,
}

impl OtaState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OtaState::UpToDate | OtaState::Aborted | OtaState::Succeeded | OtaState::Failed
        )
    }

    fn for_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::UpToDate => OtaState::UpToDate,
            Outcome::Aborted(_) => OtaState::Aborted,
            Outcome::Succeeded => OtaState::Succeeded,
            Outcome::Failed(_) => OtaState::Failed,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum OtaEvent {
    /// Begin the session
    Start,
    /// Broker acknowledged the connection (initial or after a reconnect)
    Connected,
    /// Broker refused or could not be reached before the first ConnAck
    ConnectionRefused(String),
    /// Connection dropped and the transport gave up reconnecting
    ConnectionLost(String),
    /// A parsed message from the device tree
    Message {
        message: DeviceMessage,
        /// Delivered from the broker's retained store on subscribe
        retained: bool,
    },
    /// The device sent something that does not follow the protocol
    ProtocolViolation(ProtocolError),
    /// The firmware publish was handed to the transport
    PublishCompleted,
    PublishFailed(String),
    /// The currently armed deadline expired
    Timeout,
    /// Operator interrupt
    Cancelled,
}

/// Side effects requested by a transition, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    Subscribe(Vec<String>),
    Publish { topic: String, payload: Bytes },
    ReportProgress(ProgressView),
    /// Operator-facing notice
    Notify(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: OtaState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: OtaState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    fn to(next: OtaState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// Record `outcome` on the session and move to the matching terminal state
fn finish(session: &mut Session, outcome: Outcome) -> Transition {
    let next = OtaState::for_outcome(&outcome);
    match &outcome {
        Outcome::Succeeded | Outcome::UpToDate => info!(outcome = %outcome, "OTA session finished"),
        _ => warn!(outcome = %outcome, "OTA session finished"),
    }
    session.set_outcome(outcome);
    Transition::to(next, vec![Effect::Disconnect])
}

/// Abort before the publish, fail after it
fn terminate(
    session: &mut Session,
    abort: AbortReason,
    failure: impl FnOnce() -> FailureReason,
) -> Transition {
    if session.published() {
        finish(session, Outcome::Failed(failure()))
    } else {
        finish(session, Outcome::Aborted(abort))
    }
}

/// Compute the next state for `event`
pub fn transition(session: &mut Session, state: OtaState, event: OtaEvent) -> Transition {
    if state.is_terminal() {
        debug!(?state, ?event, "Ignoring event in terminal state");
        return Transition::stay(state);
    }

    match event {
        OtaEvent::Start => on_start(session, state),
        OtaEvent::Connected => on_connected(session, state),
        OtaEvent::ConnectionRefused(reason) => match state {
            OtaState::Disconnected | OtaState::Connecting => {
                finish(session, Outcome::Aborted(AbortReason::ConnectionFailed(reason)))
            }
            _ => on_connection_lost(session, reason),
        },
        OtaEvent::ConnectionLost(reason) => on_connection_lost(session, reason),
        OtaEvent::Message { message, retained } => on_message(session, state, message, retained),
        OtaEvent::ProtocolViolation(error) => {
            warn!(error = %error, "Device protocol violation");
            let reason = error.to_string();
            terminate(
                session,
                AbortReason::ProtocolError(reason.clone()),
                || FailureReason::ProtocolError(reason),
            )
        }
        OtaEvent::PublishCompleted => match state {
            OtaState::Publishing => {
                debug!("Firmware handed to transport, waiting for device to react");
                Transition::stay(OtaState::AwaitingConfirmation)
            }
            _ => Transition::stay(state),
        },
        OtaEvent::PublishFailed(reason) => {
            finish(session, Outcome::Failed(FailureReason::PublishFailed(reason)))
        }
        OtaEvent::Timeout => on_timeout(session, state),
        OtaEvent::Cancelled => terminate(session, AbortReason::Interrupted, || {
            FailureReason::Interrupted
        }),
    }
}

fn on_start(session: &Session, state: OtaState) -> Transition {
    match state {
        OtaState::Disconnected => {
            info!(device_id = %session.device_id(), "Connecting to MQTT broker");
            Transition::to(OtaState::Connecting, vec![Effect::Connect])
        }
        _ => Transition::stay(state),
    }
}

fn on_connected(session: &Session, state: OtaState) -> Transition {
    let topics = session.topics();
    match state {
        OtaState::Disconnected | OtaState::Connecting => Transition::to(
            OtaState::AwaitingDeviceOnline,
            vec![
                Effect::Subscribe(topics.online_topics()),
                Effect::Notify(format!(
                    "Waiting for device {} to come online...",
                    session.device_id()
                )),
            ],
        ),
        // Subscriptions do not survive a reconnect; replay what this state needs
        OtaState::AwaitingDeviceOnline => {
            info!("Reconnected, re-subscribing to device state");
            Transition::to(state, vec![Effect::Subscribe(topics.online_topics())])
        }
        _ => {
            info!("Reconnected, re-subscribing to device topics");
            let mut replay = topics.online_topics();
            replay.extend(topics.device_info_topics());
            Transition::to(state, vec![Effect::Subscribe(replay)])
        }
    }
}

fn on_connection_lost(session: &mut Session, reason: String) -> Transition {
    terminate(
        session,
        AbortReason::ConnectionLost(reason.clone()),
        || FailureReason::ConnectionLost(reason),
    )
}

fn on_timeout(session: &mut Session, state: OtaState) -> Transition {
    match state {
        OtaState::Disconnected | OtaState::Connecting | OtaState::AwaitingDeviceOnline => {
            finish(session, Outcome::Aborted(AbortReason::OnlineTimeout))
        }
        OtaState::AwaitingDeviceInfo => {
            finish(session, Outcome::Aborted(AbortReason::DeviceInfoTimeout))
        }
        _ => terminate(session, AbortReason::OnlineTimeout, || {
            FailureReason::ConfirmationTimeout
        }),
    }
}

fn on_message(
    session: &mut Session,
    state: OtaState,
    message: DeviceMessage,
    retained: bool,
) -> Transition {
    debug!(?state, ?message, retained, "Device message");
    match state {
        OtaState::AwaitingDeviceOnline => awaiting_online(session, state, message),
        OtaState::AwaitingDeviceInfo => awaiting_info(session, state, message),
        OtaState::Publishing | OtaState::AwaitingConfirmation => {
            awaiting_confirmation(session, state, message, retained)
        }
        _ => {
            debug!(?state, "Message before subscription, ignoring");
            Transition::stay(state)
        }
    }
}

fn device_state_gone(session: &mut Session, device_state: DeviceState) -> Option<Transition> {
    if device_state.is_offline() || device_state == DeviceState::Alert {
        Some(finish(
            session,
            Outcome::Aborted(AbortReason::DeviceUnavailable(device_state)),
        ))
    } else {
        None
    }
}

fn awaiting_online(session: &mut Session, state: OtaState, message: DeviceMessage) -> Transition {
    match message {
        DeviceMessage::State(DeviceState::Init) => {
            info!("Device is initializing. Waiting");
            Transition::stay(state)
        }
        DeviceMessage::State(DeviceState::Ready) => {
            debug!("Device online, waiting for device info");
            Transition::to(
                OtaState::AwaitingDeviceInfo,
                vec![Effect::Subscribe(session.topics().device_info_topics())],
            )
        }
        DeviceMessage::State(other) => {
            device_state_gone(session, other).unwrap_or_else(|| Transition::stay(state))
        }
        _ => {
            debug!("Device info before the device is online, ignoring");
            Transition::stay(state)
        }
    }
}

fn awaiting_info(session: &mut Session, state: OtaState, message: DeviceMessage) -> Transition {
    match message {
        DeviceMessage::OtaEnabled(true) => {
            session.set_ota_enabled();
            evaluate_publish(session, state)
        }
        DeviceMessage::OtaEnabled(false) => {
            finish(session, Outcome::Aborted(AbortReason::OtaDisabled))
        }
        DeviceMessage::FirmwareChecksum(remote) => {
            if remote == session.checksum() {
                finish(session, Outcome::UpToDate)
            } else {
                info!(checksum = %remote, "Received current firmware checksum");
                session.set_remote_old_checksum(remote);
                evaluate_publish(session, state)
            }
        }
        DeviceMessage::FirmwareName(name) => {
            session.remote_firmware_mut().name = Some(name);
            Transition::stay(state)
        }
        DeviceMessage::FirmwareVersion(version) => {
            session.remote_firmware_mut().version = Some(version);
            Transition::stay(state)
        }
        DeviceMessage::OtaStatus(status) => {
            // Left over from an earlier attempt; only statuses after our push count
            debug!(code = status.code.as_u16(), "OTA status before publish, ignoring");
            Transition::stay(state)
        }
        DeviceMessage::State(device_state) => {
            device_state_gone(session, device_state).unwrap_or_else(|| Transition::stay(state))
        }
    }
}

/// Push the firmware once every precondition is known
fn evaluate_publish(session: &mut Session, state: OtaState) -> Transition {
    if !session.should_publish() || !session.mark_published() {
        return Transition::stay(state);
    }

    let topic = session.firmware_topic();
    info!(
        topic = %topic,
        bytes = session.firmware().len(),
        "Publishing firmware"
    );
    Transition::to(
        OtaState::Publishing,
        vec![
            Effect::Notify(session.flash_banner()),
            Effect::Publish {
                topic,
                payload: session.firmware_payload(),
            },
        ],
    )
}

fn awaiting_confirmation(
    session: &mut Session,
    state: OtaState,
    message: DeviceMessage,
    retained: bool,
) -> Transition {
    match message {
        DeviceMessage::OtaStatus(status) => on_status(session, state, status),
        DeviceMessage::FirmwareChecksum(remote) if retained && remote != session.checksum() => {
            // Retained value predates the new image (replayed on reconnect)
            debug!(
                checksum = %remote,
                "Ignoring stale retained checksum while awaiting confirmation"
            );
            Transition::stay(state)
        }
        DeviceMessage::FirmwareChecksum(remote) => {
            if remote == session.checksum() {
                finish(session, Outcome::Succeeded)
            } else {
                let expected = session.checksum().to_string();
                finish(
                    session,
                    Outcome::Failed(FailureReason::ChecksumMismatch {
                        expected,
                        actual: remote,
                    }),
                )
            }
        }
        DeviceMessage::State(device_state) => {
            info!(state = %device_state, "Device lifecycle changed while updating");
            Transition::stay(state)
        }
        DeviceMessage::FirmwareName(name) => {
            session.remote_firmware_mut().name = Some(name);
            Transition::stay(state)
        }
        DeviceMessage::FirmwareVersion(version) => {
            session.remote_firmware_mut().version = Some(version);
            Transition::stay(state)
        }
        DeviceMessage::OtaEnabled(_) => Transition::stay(state),
    }
}

fn on_status(session: &mut Session, state: OtaState, status: OtaStatus) -> Transition {
    match status.code {
        StatusCode::InProgress => match ProgressView::from_status(&status) {
            Some(view) => Transition::to(state, vec![Effect::ReportProgress(view)]),
            None => Transition::stay(state),
        },
        StatusCode::Accepted => {
            info!("Device accepted the firmware");
            Transition::stay(state)
        }
        StatusCode::Ok => {
            info!("Device wrote the firmware, waiting for reboot");
            Transition::stay(state)
        }
        StatusCode::Forbidden => finish(session, Outcome::Failed(FailureReason::Forbidden)),
        StatusCode::NotModified => {
            warn!(
                checksum = %session.checksum(),
                "Device reported not modified after the firmware was pushed"
            );
            finish(session, Outcome::Failed(FailureReason::UnexpectedNotModified))
        }
        StatusCode::BadChecksum | StatusCode::InternalError => finish(
            session,
            Outcome::Failed(FailureReason::device_rejected(status.code)),
        ),
    }
}

/// Owns a session and its current state
#[derive(Debug)]
pub struct OtaMachine {
    state: OtaState,
    session: Session,
}

impl OtaMachine {
    pub fn new(session: Session) -> Self {
        Self {
            state: OtaState::Disconnected,
            session,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Apply `event` and return the effects to perform
    pub fn handle(&mut self, event: OtaEvent) -> Vec<Effect> {
        let Transition { next, effects } = transition(&mut self.session, self.state, event);
        if next != self.state {
            debug!(from = ?self.state, to = ?next, "OTA state transition");
        }
        self.state = next;
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::Firmware;

    fn session() -> Session {
        let firmware = Firmware::from_bytes(b"new-image".to_vec()).unwrap();
        Session::new("homie/", "dev1", firmware, None)
    }

    fn msg(message: DeviceMessage) -> OtaEvent {
        OtaEvent::Message {
            message,
            retained: false,
        }
    }

    fn retained(message: DeviceMessage) -> OtaEvent {
        OtaEvent::Message {
            message,
            retained: true,
        }
    }

    fn online_machine() -> OtaMachine {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        machine.handle(OtaEvent::Connected);
        machine.handle(msg(DeviceMessage::State(DeviceState::Ready)));
        assert_eq!(machine.state(), OtaState::AwaitingDeviceInfo);
        machine
    }

    fn published_machine() -> OtaMachine {
        let mut machine = online_machine();
        machine.handle(msg(DeviceMessage::OtaEnabled(true)));
        machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".to_string())));
        assert_eq!(machine.state(), OtaState::Publishing);
        machine.handle(OtaEvent::PublishCompleted);
        assert_eq!(machine.state(), OtaState::AwaitingConfirmation);
        machine
    }

    fn publishes(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Publish { .. }))
            .count()
    }

    #[test]
    fn test_start_connects() {
        let mut machine = OtaMachine::new(session());
        let effects = machine.handle(OtaEvent::Start);
        assert_eq!(machine.state(), OtaState::Connecting);
        assert_eq!(effects, vec![Effect::Connect]);
    }

    #[test]
    fn test_connack_subscribes_to_state() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        let effects = machine.handle(OtaEvent::Connected);

        assert_eq!(machine.state(), OtaState::AwaitingDeviceOnline);
        assert_eq!(
            effects[0],
            Effect::Subscribe(vec!["homie/dev1/$state".to_string()])
        );
    }

    #[test]
    fn test_connection_refused_aborts() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        let effects = machine.handle(OtaEvent::ConnectionRefused("bad credentials".into()));

        assert_eq!(machine.state(), OtaState::Aborted);
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert!(matches!(
            machine.session().outcome(),
            Some(Outcome::Aborted(AbortReason::ConnectionFailed(_)))
        ));
    }

    #[test]
    fn test_device_lost_aborts() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        machine.handle(OtaEvent::Connected);
        let effects = machine.handle(msg(DeviceMessage::State(DeviceState::Lost)));

        assert_eq!(machine.state(), OtaState::Aborted);
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::DeviceUnavailable(
                DeviceState::Lost
            )))
        );
    }

    #[test]
    fn test_device_init_keeps_waiting() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        machine.handle(OtaEvent::Connected);
        let effects = machine.handle(msg(DeviceMessage::State(DeviceState::Init)));

        assert_eq!(machine.state(), OtaState::AwaitingDeviceOnline);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_ready_subscribes_to_device_info() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        machine.handle(OtaEvent::Connected);
        let effects = machine.handle(msg(DeviceMessage::State(DeviceState::Ready)));

        assert_eq!(machine.state(), OtaState::AwaitingDeviceInfo);
        match &effects[0] {
            Effect::Subscribe(topics) => {
                assert!(topics.contains(&"homie/dev1/$implementation/ota/status".to_string()));
                assert!(topics.contains(&"homie/dev1/$implementation/ota/enabled".to_string()));
                assert!(topics.contains(&"homie/dev1/$fw/checksum".to_string()));
            }
            other => panic!("Expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_enabled_then_checksum_publishes() {
        let mut machine = online_machine();
        let effects = machine.handle(msg(DeviceMessage::OtaEnabled(true)));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), OtaState::AwaitingDeviceInfo);

        let effects = machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert_eq!(machine.state(), OtaState::Publishing);
        assert_eq!(publishes(&effects), 1);
        assert!(machine.session().published());
        assert_eq!(machine.session().remote_old_checksum(), Some("abc123"));
    }

    #[test]
    fn test_checksum_then_enabled_publishes() {
        let mut machine = online_machine();
        let effects = machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert!(effects.is_empty());

        let effects = machine.handle(msg(DeviceMessage::OtaEnabled(true)));
        assert_eq!(machine.state(), OtaState::Publishing);

        let local = machine.session().checksum().to_string();
        let publish = effects
            .iter()
            .find_map(|e| match e {
                Effect::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .expect("publish effect");
        assert_eq!(
            publish.0,
            format!("homie/dev1/$implementation/ota/firmware/{local}")
        );
        assert_eq!(publish.1.as_ref(), b"new-image");
    }

    #[test]
    fn test_matching_checksum_is_up_to_date() {
        let mut machine = online_machine();
        let local = machine.session().checksum().to_string();
        let effects = machine.handle(msg(DeviceMessage::FirmwareChecksum(local)));

        assert_eq!(machine.state(), OtaState::UpToDate);
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert!(!machine.session().published());
    }

    #[test]
    fn test_ota_disabled_aborts_even_with_differing_checksum() {
        let mut machine = online_machine();
        machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".into())));
        let effects = machine.handle(msg(DeviceMessage::OtaEnabled(false)));

        assert_eq!(machine.state(), OtaState::Aborted);
        assert_eq!(publishes(&effects), 0);
        assert!(!machine.session().published());
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::OtaDisabled))
        );
    }

    #[test]
    fn test_status_before_publish_is_ignored() {
        let mut machine = online_machine();
        let status = OtaStatus::parse("304").unwrap();
        let effects = machine.handle(msg(DeviceMessage::OtaStatus(status)));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), OtaState::AwaitingDeviceInfo);
    }

    #[test]
    fn test_progress_reported_while_awaiting_confirmation() {
        let mut machine = published_machine();
        let status = OtaStatus::parse("206 50/200").unwrap();
        let effects = machine.handle(msg(DeviceMessage::OtaStatus(status)));

        assert_eq!(machine.state(), OtaState::AwaitingConfirmation);
        match &effects[..] {
            [Effect::ReportProgress(view)] => {
                assert_eq!(view.written, 50);
                assert_eq!(view.total, 200);
            }
            other => panic!("Expected progress report, got {other:?}"),
        }
    }

    #[test]
    fn test_forbidden_after_publish_fails() {
        let mut machine = published_machine();
        let status = OtaStatus::parse("403").unwrap();
        machine.handle(msg(DeviceMessage::OtaStatus(status)));
        assert_eq!(machine.state(), OtaState::Failed);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Failed(FailureReason::Forbidden))
        );
    }

    #[test]
    fn test_not_modified_after_publish_fails_as_anomaly() {
        let mut machine = published_machine();
        let status = OtaStatus::parse("304").unwrap();
        let effects = machine.handle(msg(DeviceMessage::OtaStatus(status)));
        assert_eq!(machine.state(), OtaState::Failed);
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Failed(FailureReason::UnexpectedNotModified))
        );
    }

    #[test]
    fn test_device_rejection_fails() {
        let mut machine = published_machine();
        let status = OtaStatus::parse("400").unwrap();
        machine.handle(msg(DeviceMessage::OtaStatus(status)));
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Failed(FailureReason::DeviceRejected(400)))
        );
    }

    #[test]
    fn test_confirmed_checksum_succeeds() {
        let mut machine = published_machine();
        let local = machine.session().checksum().to_string();
        let effects = machine.handle(msg(DeviceMessage::FirmwareChecksum(local)));
        assert_eq!(machine.state(), OtaState::Succeeded);
        assert_eq!(effects, vec![Effect::Disconnect]);
    }

    #[test]
    fn test_mismatched_checksum_after_publish_fails() {
        let mut machine = published_machine();
        machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert_eq!(machine.state(), OtaState::Failed);
        assert!(matches!(
            machine.session().outcome(),
            Some(Outcome::Failed(FailureReason::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_retained_checksum_after_publish_is_ignored() {
        let mut machine = published_machine();
        let effects = machine.handle(retained(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), OtaState::AwaitingConfirmation);
    }

    #[test]
    fn test_retained_new_checksum_after_publish_confirms() {
        let mut machine = published_machine();
        let local = machine.session().checksum().to_string();

        // Device rebooted into the new image while the link was down
        machine.handle(OtaEvent::Connected);
        let effects = machine.handle(retained(DeviceMessage::FirmwareChecksum(local)));

        assert_eq!(machine.state(), OtaState::Succeeded);
        assert_eq!(machine.session().outcome(), Some(&Outcome::Succeeded));
        assert_eq!(effects, vec![Effect::Disconnect]);
    }

    #[test]
    fn test_device_reboot_after_publish_is_not_fatal() {
        let mut machine = published_machine();
        machine.handle(msg(DeviceMessage::State(DeviceState::Lost)));
        machine.handle(msg(DeviceMessage::State(DeviceState::Init)));
        machine.handle(msg(DeviceMessage::State(DeviceState::Ready)));
        assert_eq!(machine.state(), OtaState::AwaitingConfirmation);
    }

    #[test]
    fn test_reconnect_replays_subscriptions() {
        let mut machine = published_machine();
        let effects = machine.handle(OtaEvent::Connected);
        assert_eq!(machine.state(), OtaState::AwaitingConfirmation);
        match &effects[..] {
            [Effect::Subscribe(topics)] => {
                assert!(topics.contains(&"homie/dev1/$state".to_string()));
                assert!(topics.contains(&"homie/dev1/$fw/checksum".to_string()));
            }
            other => panic!("Expected resubscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_no_second_publish_after_reconnect() {
        let mut machine = published_machine();
        machine.handle(OtaEvent::Connected);
        let effects = machine.handle(msg(DeviceMessage::OtaEnabled(true)));
        assert_eq!(publishes(&effects), 0);
        let effects = machine.handle(retained(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert_eq!(publishes(&effects), 0);
    }

    #[test]
    fn test_timeouts() {
        let mut machine = OtaMachine::new(session());
        machine.handle(OtaEvent::Start);
        machine.handle(OtaEvent::Connected);
        machine.handle(OtaEvent::Timeout);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::OnlineTimeout))
        );

        let mut machine = online_machine();
        machine.handle(OtaEvent::Timeout);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::DeviceInfoTimeout))
        );

        let mut machine = published_machine();
        machine.handle(OtaEvent::Timeout);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Failed(FailureReason::ConfirmationTimeout))
        );
    }

    #[test]
    fn test_cancel_before_and_after_publish() {
        let mut machine = online_machine();
        let effects = machine.handle(OtaEvent::Cancelled);
        assert_eq!(effects, vec![Effect::Disconnect]);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::Interrupted))
        );

        let mut machine = published_machine();
        machine.handle(OtaEvent::Cancelled);
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Failed(FailureReason::Interrupted))
        );
    }

    #[test]
    fn test_protocol_violation_is_fatal() {
        let mut machine = online_machine();
        machine.handle(OtaEvent::ProtocolViolation(ProtocolError::UnknownState(
            "banana".into(),
        )));
        assert!(matches!(
            machine.session().outcome(),
            Some(Outcome::Aborted(AbortReason::ProtocolError(_)))
        ));

        let mut machine = published_machine();
        machine.handle(OtaEvent::ProtocolViolation(ProtocolError::UnknownStatusCode(
            418,
        )));
        assert!(matches!(
            machine.session().outcome(),
            Some(Outcome::Failed(FailureReason::ProtocolError(_)))
        ));
    }

    #[test]
    fn test_terminal_state_ignores_events() {
        let mut machine = online_machine();
        machine.handle(msg(DeviceMessage::OtaEnabled(false)));
        assert_eq!(machine.state(), OtaState::Aborted);

        let effects = machine.handle(msg(DeviceMessage::FirmwareChecksum("abc123".into())));
        assert!(effects.is_empty());
        let effects = machine.handle(OtaEvent::Cancelled);
        assert!(effects.is_empty());
        assert_eq!(
            machine.session().outcome(),
            Some(&Outcome::Aborted(AbortReason::OtaDisabled))
        );
    }

    #[test]
    fn test_connection_lost_after_publish_fails() {
        let mut machine = published_machine();
        machine.handle(OtaEvent::ConnectionLost("network down".into()));
        assert!(matches!(
            machine.session().outcome(),
            Some(Outcome::Failed(FailureReason::ConnectionLost(_)))
        ));
    }

    #[test]
    fn test_remote_firmware_info_recorded() {
        let mut machine = online_machine();
        machine.handle(msg(DeviceMessage::FirmwareName("aquarium".into())));
        machine.handle(msg(DeviceMessage::FirmwareVersion("1.0.2".into())));
        let remote = machine.session().remote_firmware();
        assert_eq!(remote.name.as_deref(), Some("aquarium"));
        assert_eq!(remote.version.as_deref(), Some("1.0.2"));
    }
}
