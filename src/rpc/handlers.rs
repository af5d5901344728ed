use super::types::*;
use crate::node::CoordinatorHandle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

type AppState = CoordinatorHandle;

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

pub async fn health(State(coordinator): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".into(),
        active_rounds: coordinator.round_count(),
    })
}

pub async fn status(
    State(coordinator): State<AppState>,
    Json(req): Json<RoundStateRequest>,
) -> Json<RoundStateResponse> {
    Json(coordinator.get_status(req).await)
}

pub async fn input_registration(
    State(coordinator): State<AppState>,
    Json(req): Json<InputRegistrationRequest>,
) -> Result<Json<InputRegistrationResponse>, ErrorResponse> {
    Ok(Json(coordinator.register_input(req).await?))
}

pub async fn input_unregistration(
    State(coordinator): State<AppState>,
    Json(req): Json<InputUnregistrationRequest>,
) -> Result<Json<()>, ErrorResponse> {
    coordinator.remove_input(req).await?;
    Ok(Json(()))
}

pub async fn connection_confirmation(
    State(coordinator): State<AppState>,
    Json(req): Json<ConnectionConfirmationRequest>,
) -> Result<Json<ConnectionConfirmationResponse>, ErrorResponse> {
    Ok(Json(coordinator.confirm_connection(req).await?))
}

pub async fn output_registration(
    State(coordinator): State<AppState>,
    Json(req): Json<OutputRegistrationRequest>,
) -> Result<Json<OutputRegistrationResponse>, ErrorResponse> {
    Ok(Json(coordinator.register_output(req).await?))
}

pub async fn ready_to_sign(
    State(coordinator): State<AppState>,
    Json(req): Json<ReadyToSignRequest>,
) -> Result<Json<()>, ErrorResponse> {
    coordinator.ready_to_sign(req).await?;
    Ok(Json(()))
}

pub async fn transaction_signature(
    State(coordinator): State<AppState>,
    Json(req): Json<TransactionSignaturesRequest>,
) -> Result<Json<()>, ErrorResponse> {
    coordinator.sign_transaction(req).await?;
    Ok(Json(()))
}
