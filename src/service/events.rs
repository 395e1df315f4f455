use serde::{Deserialize, Serialize};

/// Outcome string of one verify attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyResult {
    Match,
    NoMatch,
}

impl VerifyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyResult::Match => "verify-match",
            VerifyResult::NoMatch => "verify-no-match",
        }
    }
}

/// Outcome string of one enrollment step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollResult {
    StagePassed,
    Completed,
    Failed,
}

impl EnrollResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollResult::StagePassed => "enroll-stage-passed",
            EnrollResult::Completed => "enroll-completed",
            EnrollResult::Failed => "enroll-failed",
        }
    }
}

/// Signals a device delivers to the claiming client, in production order.
/// `done` marks the terminal signal of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    VerifyStatus { result: VerifyResult, done: bool },
    EnrollStatus { result: EnrollResult, done: bool },
}

impl DeviceEvent {
    pub fn is_done(&self) -> bool {
        match self {
            DeviceEvent::VerifyStatus { done, .. } | DeviceEvent::EnrollStatus { done, .. } => {
                *done
            }
        }
    }
}
