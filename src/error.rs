use crate::crypto::credentials::CredentialError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable codes surfaced to participants; they survive the HTTP boundary intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    WrongPhase,
    RoundNotFound,
    AliceNotFound,
    AliceAlreadyConfirmed,
    InputNotFound,
    InputAlreadyRegistered,
    InputBanned,
    InputLongBanned,
    InputNotWhitelisted,
    InputSpent,
    InputUnconfirmed,
    WrongOwnershipProof,
    NotEnoughFunds,
    TooMuchFunds,
    TooMuchVsize,
    ScriptNotAllowed,
    NonStandardOutput,
    CryptoException,
    InvalidCredentials,
    NegativeBalance,
    CredentialAlreadySpent,
    WrongNumberOfCredentials,
    IncorrectRequestedAmount,
    IncorrectRequestedVsize,
    DeltaNotZero,
    WitnessAlreadyProvided,
    WrongWitness,
    TooManyInputs,
    NonUniqueInputs,
    ProtocolViolation,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<CredentialError> for ProtocolError {
    fn from(e: CredentialError) -> Self {
        let code = match &e {
            CredentialError::AlreadySpent => ErrorCode::CredentialAlreadySpent,
            CredentialError::NegativeBalance => ErrorCode::NegativeBalance,
            CredentialError::WrongNumberOfRequested { .. }
            | CredentialError::TooManyPresented { .. }
            | CredentialError::WrongNumberOfIssued { .. } => ErrorCode::WrongNumberOfCredentials,
            CredentialError::Malformed
            | CredentialError::ValueOutOfRange(_)
            | CredentialError::Overflow => ErrorCode::InvalidCredentials,
            CredentialError::InvalidIssuerProof => ErrorCode::ProtocolViolation,
            // Never say which check failed.
            CredentialError::InvalidProof | CredentialError::Proof(_) => {
                return ProtocolError::new(ErrorCode::CryptoException, "proof invalid")
            }
        };
        ProtocolError::new(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::zk::ProofError;

    #[test]
    fn codes_serialize_by_name() {
        let err = ProtocolError::new(ErrorCode::InputBanned, "banned until later");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"InputBanned\""));
        let back: ProtocolError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn crypto_failures_are_opaque() {
        let a: ProtocolError = CredentialError::InvalidProof.into();
        let b: ProtocolError = CredentialError::Proof(ProofError::Unsatisfied).into();
        assert_eq!(a, b);
        assert_eq!(a.message, "proof invalid");
    }
}
