use thiserror::Error;

use crate::peer::engine::EngineError;
use crate::peer::state::NegotiationState;
use crate::peer::types::Role;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Повторный initiate на живом переговорщике
    #[error("negotiation already active")]
    AlreadyActive,
    /// Операция вызвана не в том порядке протокола
    #[error("{op} is not valid in state {state}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] EngineError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("role {0} is not enabled for this orchestrator")]
    RoleNotEnabled(Role),
    #[error("no local session")]
    NoSession,
    /// Реестр закрыт: учитель не принимает offer
    #[error("server not started")]
    NotServing,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed payload for action {action}: {source}")]
    MalformedPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
