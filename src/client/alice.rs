use super::api::CoordinatorApi;
use super::updater::RoundStateUpdater;
use super::ClientError;
use crate::core::types::*;
use crate::core::{Coin, Witness};
use crate::crypto::credentials::{CredentialError, CredentialPool, WabiSabiClient};
use crate::crypto::ownership::{OwnershipProof, INPUT_OWNERSHIP_LABEL};
use crate::crypto::Scalar;
use crate::round::{Phase, RoundParameters, RoundState};
use crate::rpc::types::*;
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One coin's participation in one round.
#[derive(Debug)]
pub struct AliceSession {
    pub round_id: RoundId,
    pub alice_id: AliceId,
    parameters: RoundParameters,
    amount_client: WabiSabiClient,
    vsize_client: WabiSabiClient,
    amount_credentials: CredentialPool,
    vsize_credentials: CredentialPool,
    outputs: Vec<TxOut>,
}

impl AliceSession {
    pub fn amount_available(&self) -> u64 {
        self.amount_credentials.total()
    }

    pub fn vsize_available(&self) -> u64 {
        self.vsize_credentials.total()
    }

    pub fn registered_outputs(&self) -> &[TxOut] {
        &self.outputs
    }
}

pub struct AliceClient {
    api: Arc<dyn CoordinatorApi>,
    coin: Coin,
    secret: Scalar,
}

impl AliceClient {
    pub fn new(api: Arc<dyn CoordinatorApi>, coin: Coin, secret: Scalar) -> Self {
        Self { api, coin, secret }
    }

    pub fn coin(&self) -> &Coin {
        &self.coin
    }

    pub async fn register_input(&self, round: &RoundState) -> Result<AliceSession, ClientError> {
        let parameters = round.coinjoin_state.parameters().clone();
        let amount_client = WabiSabiClient::new(
            round.amount_credential_issuer_parameters,
            parameters.credential_count,
            parameters.max_amount_credential_value(),
        );
        let vsize_client = WabiSabiClient::new(
            round.vsize_credential_issuer_parameters,
            parameters.credential_count,
            parameters.max_vsize_credential_value(),
        );
        let ownership_proof = OwnershipProof::generate(&self.secret, INPUT_OWNERSHIP_LABEL, round.id.as_bytes(), &mut OsRng)
            .map_err(CredentialError::from)?;
        let (zero_amount, amount_validation) = amount_client.create_request_for_zero_amount(&mut OsRng)?;
        let (zero_vsize, vsize_validation) = vsize_client.create_request_for_zero_amount(&mut OsRng)?;

        let resp = self
            .api
            .register_input(InputRegistrationRequest {
                round_id: round.id,
                outpoint: self.coin.outpoint,
                ownership_proof,
                zero_amount_credential_request: zero_amount,
                zero_vsize_credential_request: zero_vsize,
            })
            .await?;
        // Zero credentials carry nothing; checking them still catches a
        // coordinator issuing under keys other than the round's.
        amount_client.handle_response(&resp.amount_credentials, amount_validation)?;
        vsize_client.handle_response(&resp.vsize_credentials, vsize_validation)?;
        tracing::info!("Registered {:?} in round {}", self.coin.outpoint, round.id.short());

        Ok(AliceSession {
            round_id: round.id,
            alice_id: resp.alice_id,
            parameters,
            amount_client,
            vsize_client,
            amount_credentials: CredentialPool::new(),
            vsize_credentials: CredentialPool::new(),
            outputs: Vec::new(),
        })
    }

    pub async fn remove_input(&self, session: &AliceSession) -> Result<(), ClientError> {
        self.api
            .remove_input(InputUnregistrationRequest {
                round_id: session.round_id,
                alice_id: session.alice_id,
            })
            .await
    }

    /// Request real credentials for the coin's effective value and its
    /// share of the vsize allocation.
    pub async fn confirm_connection(&self, session: &mut AliceSession) -> Result<(), ClientError> {
        let p = &session.parameters;
        let effective = self
            .coin
            .effective_value(p.fee_rate, p.coordination_fee_rate)
            .ok_or_else(|| ClientError::ProtocolViolation("coin cannot pay this round's fees".into()))?;
        let input_vsize = self.coin.input_vsize().unwrap_or(p.max_vsize_allocation_per_alice);
        let vsize_allowance = p.max_vsize_allocation_per_alice.saturating_sub(input_vsize);

        let k = session.amount_client.credential_count();
        let (amount_req, amount_validation) =
            session
                .amount_client
                .create_request(&first_then_zeros(effective, k), &[], &mut OsRng)?;
        let (vsize_req, vsize_validation) =
            session
                .vsize_client
                .create_request(&first_then_zeros(vsize_allowance, k), &[], &mut OsRng)?;

        let resp = self
            .api
            .confirm_connection(ConnectionConfirmationRequest {
                round_id: session.round_id,
                alice_id: session.alice_id,
                amount_credential_request: amount_req,
                vsize_credential_request: vsize_req,
            })
            .await?;
        let amounts = session
            .amount_client
            .handle_response(&resp.amount_credentials, amount_validation)?;
        let vsizes = session
            .vsize_client
            .handle_response(&resp.vsize_credentials, vsize_validation)?;
        session.amount_credentials.add(amounts);
        session.vsize_credentials.add(vsizes);
        Ok(())
    }

    /// Pay `value` sat to `script`, keeping the change as credentials.
    pub async fn register_output(
        &self,
        session: &mut AliceSession,
        script_pubkey: ScriptPubKey,
        value: u64,
    ) -> Result<(), ClientError> {
        let output_vsize = script_pubkey.output_vsize();
        let cost = value + session.parameters.fee_rate.fee(output_vsize);
        let k = session.amount_client.credential_count();

        let amounts = session.amount_credentials.take_with_total(cost, k).ok_or_else(|| {
            ClientError::ProtocolViolation(format!("{} sat of credentials cannot pay {} sat", session.amount_available(), cost))
        })?;
        let vsizes = match session.vsize_credentials.take_with_total(output_vsize, k) {
            Some(v) => v,
            None => {
                session.amount_credentials.add(amounts);
                return Err(ClientError::ProtocolViolation("not enough vsize credentials".into()));
            }
        };
        let amount_change = amounts.iter().map(|c| c.value).sum::<u64>() - cost;
        let vsize_change = vsizes.iter().map(|c| c.value).sum::<u64>() - output_vsize;

        let (amount_req, amount_validation) =
            session
                .amount_client
                .create_request(&first_then_zeros(amount_change, k), &amounts, &mut OsRng)?;
        let (vsize_req, vsize_validation) =
            session
                .vsize_client
                .create_request(&first_then_zeros(vsize_change, k), &vsizes, &mut OsRng)?;

        let sent = self
            .api
            .register_output(OutputRegistrationRequest {
                round_id: session.round_id,
                script_pubkey: script_pubkey.clone(),
                amount_credential_request: amount_req,
                vsize_credential_request: vsize_req,
            })
            .await;
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                // Rejected requests spend nothing.
                session.amount_credentials.add(amounts);
                session.vsize_credentials.add(vsizes);
                return Err(e);
            }
        };
        let amount_change = session
            .amount_client
            .handle_response(&resp.amount_credentials, amount_validation)?;
        let vsize_change = session
            .vsize_client
            .handle_response(&resp.vsize_credentials, vsize_validation)?;
        session.amount_credentials.add(amount_change);
        session.vsize_credentials.add(vsize_change);
        session.outputs.push(TxOut { value, script_pubkey });
        Ok(())
    }

    /// Everything left after the output's own fee goes to `script_pubkey`.
    pub async fn register_remaining(
        &self,
        session: &mut AliceSession,
        script_pubkey: ScriptPubKey,
    ) -> Result<(), ClientError> {
        let fee = session.parameters.fee_rate.fee(script_pubkey.output_vsize());
        let value = session.amount_available().checked_sub(fee).ok_or_else(|| {
            ClientError::ProtocolViolation("credentials do not cover the output fee".into())
        })?;
        self.register_output(session, script_pubkey, value).await
    }

    pub async fn ready_to_sign(&self, session: &AliceSession) -> Result<(), ClientError> {
        self.api
            .ready_to_sign(ReadyToSignRequest {
                round_id: session.round_id,
                alice_id: session.alice_id,
            })
            .await
    }

    /// Sign only a transaction that spends our coin and pays every output
    /// we registered.
    pub async fn sign(&self, session: &AliceSession, round: &RoundState) -> Result<(), ClientError> {
        let signing = round
            .coinjoin_state
            .as_signing()
            .ok_or_else(|| ClientError::ProtocolViolation("round is not in the signing state".into()))?;
        let tx = signing.create_unsigned_transaction();
        if !tx.inputs.iter().any(|i| i.previous_output == self.coin.outpoint) {
            return Err(ClientError::ProtocolViolation("our input is missing from the transaction".into()));
        }
        let mut remaining = tx.outputs.clone();
        for ours in &session.outputs {
            match remaining.iter().position(|o| o == ours) {
                Some(pos) => {
                    remaining.swap_remove(pos);
                }
                None => {
                    return Err(ClientError::ProtocolViolation(format!(
                        "output of {} sat to {} is missing",
                        ours.value, ours.script_pubkey
                    )))
                }
            }
        }

        let witness = Witness::sign(&self.secret, &tx.sighash(), &mut OsRng).map_err(CredentialError::from)?;
        self.api
            .sign_transaction(TransactionSignaturesRequest {
                round_id: session.round_id,
                witnesses: vec![InputWitness {
                    outpoint: self.coin.outpoint,
                    witness,
                }],
            })
            .await
    }

    /// Drive the coin through `round` into a single output to `destination`
    /// and return the round's final state.
    pub async fn participate(
        &self,
        updater: &RoundStateUpdater,
        round: &RoundState,
        destination: ScriptPubKey,
        cancel: CancellationToken,
    ) -> Result<RoundState, ClientError> {
        let mut session = self.register_input(round).await?;

        updater
            .create_round_awaiter_for_phase(round.id, Phase::ConnectionConfirmation, cancel.clone())
            .await?;
        self.confirm_connection(&mut session).await?;

        updater
            .create_round_awaiter_for_phase(round.id, Phase::OutputRegistration, cancel.clone())
            .await?;
        self.register_remaining(&mut session, destination).await?;
        self.ready_to_sign(&session).await?;

        let signing = updater
            .create_round_awaiter_for_phase(round.id, Phase::TransactionSigning, cancel.clone())
            .await?;
        self.sign(&session, &signing).await?;

        updater
            .create_round_awaiter_for_phase(round.id, Phase::Ended, cancel)
            .await
    }
}

fn first_then_zeros(value: u64, count: usize) -> Vec<u64> {
    let mut amounts = vec![0u64; count.max(1)];
    amounts[0] = value;
    amounts
}
