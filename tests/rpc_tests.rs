use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wabisabi::broadcast::FileBroadcaster;
use wabisabi::client::{AliceClient, ClientError, CoordinatorApi, HttpCoordinatorClient, RoundStateUpdater};
use wabisabi::config::CoordinatorConfig;
use wabisabi::core::Coin;
use wabisabi::crypto::group::random_scalar;
use wabisabi::crypto::GroupElement;
use wabisabi::error::ErrorCode;
use wabisabi::node::CoordinatorHandle;
use wabisabi::prison::Prison;
use wabisabi::round::{Arena, EndRoundState, Phase};
use wabisabi::rpc::types::*;
use wabisabi::rpc::RpcServer;
use wabisabi::utxo::MemoryUtxoSet;
use wabisabi::*;

/// Start an arena behind a live RPC server. The temp dir must stay alive.
async fn start_rpc() -> (u16, Arc<Arena>, Arc<MemoryUtxoSet>, TempDir) {
    let temp = TempDir::new().unwrap();
    let utxos = Arc::new(MemoryUtxoSet::new());
    let prison = Prison::load(temp.path().join("prison.txt"), chrono::Duration::hours(24), utxos.as_ref())
        .await
        .unwrap();
    let config = CoordinatorConfig {
        min_input_count_by_round: 2,
        max_input_count_by_round: 2,
        max_registrable_amount: 10_000_000,
        ..CoordinatorConfig::default()
    };
    let broadcaster = FileBroadcaster::new(temp.path().join("broadcast"));
    let arena = Arc::new(Arena::new(config, Arc::new(prison), utxos.clone(), Arc::new(broadcaster)));
    arena.step(Utc::now()).await;

    // Use a random high port to reduce collisions.
    let rpc_port = 18500 + (rand::random::<u16>() % 1000);
    let rpc_server = RpcServer::new(rpc_port);
    let handle = CoordinatorHandle::new(arena.clone());
    tokio::spawn(async move {
        rpc_server.run(handle).await.unwrap();
    });

    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(150)).await;

    (rpc_port, arena, utxos, temp)
}

fn url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

fn funded_alice(api: Arc<dyn CoordinatorApi>, utxos: &MemoryUtxoSet, value: u64) -> AliceClient {
    let secret = random_scalar(&mut OsRng);
    let key = GroupElement::generator() * &secret;
    let txout = TxOut {
        value,
        script_pubkey: ScriptPubKey::p2wpkh(&key.to_bytes()),
    };
    let outpoint = OutPoint::new(Txid(rand::random()), 0);
    utxos.insert(outpoint, txout.clone(), 1);
    AliceClient::new(api, Coin::new(outpoint, txout), secret)
}

#[tokio::test]
async fn test_rpc_health() {
    let (port, _arena, _utxos, _temp) = start_rpc().await;
    let resp = reqwest::get(format!("{}/health", url(port))).await.unwrap();
    assert!(resp.status().is_success());
    let body: HealthResponse = resp.json().await.unwrap();
    assert_eq!(body.status, "OK");
    assert_eq!(body.active_rounds, 1);
}

#[tokio::test]
async fn test_rpc_status_honors_checkpoints() {
    let (port, _arena, utxos, _temp) = start_rpc().await;
    let client = Arc::new(HttpCoordinatorClient::new(url(port)).unwrap());

    let full = client.get_status(RoundStateRequest::default()).await.unwrap();
    assert_eq!(full.round_states.len(), 1);
    let round = full.round_states[0].clone();
    assert_eq!(round.phase, Phase::InputRegistration);
    // RoundCreated only.
    assert_eq!(round.coinjoin_state.events.len(), 1);

    let state = wabisabi::round::RoundState::from_delta(&round).unwrap();
    let alice = funded_alice(client.clone(), &utxos, 50_000);
    alice.register_input(&state).await.unwrap();

    let since = client
        .get_status(RoundStateRequest {
            checkpoints: vec![RoundStateCheckpoint {
                round_id: round.id,
                state_id: state.order(),
            }],
        })
        .await
        .unwrap();
    let delta = &since.round_states[0].coinjoin_state;
    assert_eq!(delta.since, 1);
    assert_eq!(delta.events.len(), 1);
    let merged = state.merge_back(&since.round_states[0]).unwrap();
    assert_eq!(merged.coinjoin_state.inputs().len(), 1);
}

#[tokio::test]
async fn test_rpc_error_codes_survive() {
    let (port, _arena, _utxos, _temp) = start_rpc().await;

    let resp = reqwest::Client::new()
        .post(format!("{}/input-unregistration", url(port)))
        .json(&InputUnregistrationRequest {
            round_id: RoundId(rand::random()),
            alice_id: AliceId::random(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error_code"], "RoundNotFound");

    let client = HttpCoordinatorClient::new(url(port)).unwrap();
    let err = client
        .ready_to_sign(ReadyToSignRequest {
            round_id: RoundId(rand::random()),
            alice_id: AliceId::random(),
        })
        .await
        .unwrap_err();
    match err {
        ClientError::Protocol(e) => assert_eq!(e.code, ErrorCode::RoundNotFound),
        other => panic!("expected a protocol error, got {}", other),
    }
}

#[tokio::test]
async fn test_rpc_rejects_malformed_json() {
    let (port, _arena, _utxos, _temp) = start_rpc().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/input-registration", url(port)))
        .header("content-type", "application/json")
        .body("{\"round_id\": 7}")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn test_rpc_full_round_over_http() {
    let (port, arena, utxos, temp) = start_rpc().await;
    let api: Arc<dyn CoordinatorApi> = Arc::new(HttpCoordinatorClient::new(url(port)).unwrap());
    let updater = RoundStateUpdater::start(api.clone(), Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let round = updater
        .create_round_awaiter(|r| r.phase == Phase::InputRegistration, cancel.clone())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let alice = funded_alice(api.clone(), &utxos, 80_000);
        let updater = updater.clone();
        let round = round.clone();
        let cancel = cancel.clone();
        let destination = ScriptPubKey::p2wpkh(&(GroupElement::generator() * &random_scalar(&mut OsRng)).to_bytes());
        tasks.push(tokio::spawn(async move {
            alice.participate(&updater, &round, destination, cancel).await
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(60);
    while !tasks.iter().all(|t| t.is_finished()) {
        assert!(Instant::now() < deadline, "round did not finish in time");
        arena.step(Utc::now()).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    for task in tasks {
        let state = task.await.unwrap().unwrap();
        assert_eq!(state.end_round_state, EndRoundState::TransactionBroadcasted);
    }

    let hex_files: Vec<_> = std::fs::read_dir(temp.path().join("broadcast"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(hex_files.len(), 1);
    assert!(hex_files[0].extension().is_some_and(|e| e == "hex"));

    updater.stop().await;
    assert!(!updater.is_running());
}
