use super::ClientError;
use crate::rpc::types::*;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Every call a participant makes to a coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn get_status(&self, req: RoundStateRequest) -> Result<RoundStateResponse, ClientError>;

    async fn register_input(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse, ClientError>;

    async fn remove_input(&self, req: InputUnregistrationRequest) -> Result<(), ClientError>;

    async fn confirm_connection(
        &self,
        req: ConnectionConfirmationRequest,
    ) -> Result<ConnectionConfirmationResponse, ClientError>;

    async fn register_output(&self, req: OutputRegistrationRequest) -> Result<OutputRegistrationResponse, ClientError>;

    async fn ready_to_sign(&self, req: ReadyToSignRequest) -> Result<(), ClientError>;

    async fn sign_transaction(&self, req: TransactionSignaturesRequest) -> Result<(), ClientError>;
}

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpCoordinatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, ClientError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(req)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            let body: ErrorResponse = resp.json().await?;
            return Err(ClientError::Protocol(body.into()));
        }
        if !status.is_success() {
            return Err(ClientError::Transport(format!("{} answered {}", path, status)));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinatorClient {
    async fn get_status(&self, req: RoundStateRequest) -> Result<RoundStateResponse, ClientError> {
        self.post("/status", &req).await
    }

    async fn register_input(&self, req: InputRegistrationRequest) -> Result<InputRegistrationResponse, ClientError> {
        self.post("/input-registration", &req).await
    }

    async fn remove_input(&self, req: InputUnregistrationRequest) -> Result<(), ClientError> {
        self.post("/input-unregistration", &req).await
    }

    async fn confirm_connection(
        &self,
        req: ConnectionConfirmationRequest,
    ) -> Result<ConnectionConfirmationResponse, ClientError> {
        self.post("/connection-confirmation", &req).await
    }

    async fn register_output(&self, req: OutputRegistrationRequest) -> Result<OutputRegistrationResponse, ClientError> {
        self.post("/output-registration", &req).await
    }

    async fn ready_to_sign(&self, req: ReadyToSignRequest) -> Result<(), ClientError> {
        self.post("/ready-to-sign", &req).await
    }

    async fn sign_transaction(&self, req: TransactionSignaturesRequest) -> Result<(), ClientError> {
        self.post("/transaction-signature", &req).await
    }
}
