//! Participant side: talking to a coordinator, tracking round state and
//! walking one coin through a round.

pub mod alice;
pub mod api;
pub mod descriptor;
pub mod updater;

pub use alice::{AliceClient, AliceSession};
pub use api::{CoordinatorApi, HttpCoordinatorClient};
pub use descriptor::{CoordinatorDescriptor, DescriptorError};
pub use updater::RoundStateUpdater;

use crate::crypto::credentials::CredentialError;
use crate::error::ProtocolError;
use crate::round::EndRoundState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The coordinator refused the request; code and message are its own.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    /// The coordinator sent something it could not honestly have sent.
    #[error("coordinator protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("round ended with {0:?}")]
    RoundEnded(EndRoundState),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("round state updater stopped")]
    Stopped,
}

impl ClientError {
    /// Fatal errors abort participation and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ProtocolViolation(_) | ClientError::Credential(CredentialError::InvalidIssuerProof)
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}
