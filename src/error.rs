use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation not applicable in stage: {0}")]
    NotApplicable(String),

    #[error("Rejected by remote flow: {0}")]
    RemoteRejected(String),

    #[error("Timed out waiting on remote page: {0}")]
    RemoteTimeout(String),

    #[error("Flow reached an unresolvable challenge: {0}")]
    UnresolvedChallenge(String),

    #[error("Failed to launch Chrome: {0}")]
    LaunchFailed(String),

    #[error("Failed to connect to Chrome: {0}")]
    ConnectionFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("CDP error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),

    #[error("Internal fault: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
