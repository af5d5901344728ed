use crate::core::types::*;
use crate::core::Witness;
use crate::crypto::credentials::{CredentialsResponse, RealCredentialsRequest};
use crate::crypto::ownership::OwnershipProof;
use crate::error::{ErrorCode, ProtocolError};
use crate::round::RoundStateDelta;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundStateCheckpoint {
    pub round_id: RoundId,
    /// Number of events the caller already holds.
    pub state_id: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoundStateRequest {
    pub checkpoints: Vec<RoundStateCheckpoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundStateResponse {
    pub round_states: Vec<RoundStateDelta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputRegistrationRequest {
    pub round_id: RoundId,
    pub outpoint: OutPoint,
    pub ownership_proof: OwnershipProof,
    pub zero_amount_credential_request: RealCredentialsRequest,
    pub zero_vsize_credential_request: RealCredentialsRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputRegistrationResponse {
    pub alice_id: AliceId,
    pub amount_credentials: CredentialsResponse,
    pub vsize_credentials: CredentialsResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputUnregistrationRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfirmationRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
    pub amount_credential_request: RealCredentialsRequest,
    pub vsize_credential_request: RealCredentialsRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfirmationResponse {
    pub amount_credentials: CredentialsResponse,
    pub vsize_credentials: CredentialsResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputRegistrationRequest {
    pub round_id: RoundId,
    pub script_pubkey: ScriptPubKey,
    pub amount_credential_request: RealCredentialsRequest,
    pub vsize_credential_request: RealCredentialsRequest,
}

/// Change credentials handed back after paying for an output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputRegistrationResponse {
    pub amount_credentials: CredentialsResponse,
    pub vsize_credentials: CredentialsResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyToSignRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputWitness {
    pub outpoint: OutPoint,
    pub witness: Witness,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionSignaturesRequest {
    pub round_id: RoundId,
    pub witnesses: Vec<InputWitness>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_rounds: usize,
}

/// Body of every 400 answer. Clients turn it back into the same
/// [`ProtocolError`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub message: String,
}

impl From<ProtocolError> for ErrorResponse {
    fn from(e: ProtocolError) -> Self {
        Self {
            error_code: e.code,
            message: e.message,
        }
    }
}

impl From<ErrorResponse> for ProtocolError {
    fn from(e: ErrorResponse) -> Self {
        ProtocolError::new(e.error_code, e.message)
    }
}
