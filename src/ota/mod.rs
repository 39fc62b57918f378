//! OTA update session: state machine, session record and the driver that
//! runs them over a transport

pub mod orchestrator;
pub mod outcome;
pub mod session;
pub mod state_machine;

pub use orchestrator::{OtaOrchestrator, OtaReport, RunOptions};
pub use outcome::{
    AbortReason, FailureReason, Outcome, EXIT_ABORTED, EXIT_FAILED, EXIT_INPUT_ERROR, EXIT_OK,
};
pub use session::{RemoteFirmware, Session};
pub use state_machine::{transition, Effect, OtaEvent, OtaMachine, OtaState, Transition};
