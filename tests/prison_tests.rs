use chrono::{Duration, Utc};
use tempfile::TempDir;
use wabisabi::prison::{BannedUtxo, Prison};
use wabisabi::utxo::MemoryUtxoSet;
use wabisabi::*;

fn unspent(utxos: &MemoryUtxoSet, n: u8) -> OutPoint {
    let outpoint = OutPoint::new(Txid(hash(&[n])), n as u32);
    let txout = TxOut {
        value: 10_000,
        script_pubkey: ScriptPubKey::p2wpkh(&[n; 33]),
    };
    utxos.insert(outpoint, txout, 1);
    outpoint
}

fn round(label: &[u8]) -> RoundId {
    RoundId(hash(label))
}

#[tokio::test]
async fn bans_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prison.txt");
    let utxos = MemoryUtxoSet::new();
    let (a, b) = (unspent(&utxos, 1), unspent(&utxos, 2));

    let prison = Prison::load(&path, Duration::hours(24), &utxos).await.unwrap();
    let now = Utc::now();
    prison.ban_utxos(2, now, false, round(b"r1"), [a]).await.unwrap();
    prison.ban_utxos(1, now, true, round(b"r1"), [b]).await.unwrap();
    drop(prison);

    let reloaded = Prison::load(&path, Duration::hours(24), &utxos).await.unwrap();
    assert_eq!(reloaded.count_banned().await, 1);
    assert_eq!(reloaded.count_noted().await, 1);
    let banned = reloaded.try_get_banned(&a, false).await.unwrap();
    assert_eq!(banned.severity, 2);
    assert_eq!(banned.banned_for_round, round(b"r1"));
    assert_eq!(banned.time_of_ban.timestamp(), now.timestamp());
}

#[tokio::test]
async fn load_prunes_spent_expired_and_garbage_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prison.txt");
    let utxos = MemoryUtxoSet::new();
    let (kept, spent, stale) = (unspent(&utxos, 1), unspent(&utxos, 2), unspent(&utxos, 3));

    let now = Utc::now();
    let line = |outpoint, time| {
        BannedUtxo {
            outpoint,
            severity: 1,
            time_of_ban: time,
            is_noted: false,
            banned_for_round: round(b"r"),
        }
        .to_string()
    };
    let text = [
        line(kept, now),
        line(spent, now),
        line(stale, now - Duration::hours(48)),
        "not a prison line".to_string(),
    ]
    .join("\n");
    std::fs::write(&path, text).unwrap();
    utxos.spend(&spent);

    let prison = Prison::load(&path, Duration::hours(24), &utxos).await.unwrap();
    let all = prison.banned_utxos().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].outpoint, kept);

    // The file is rewritten with only the surviving entry.
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert_eq!(on_disk.lines().count(), 1);
}

#[tokio::test]
async fn repeat_offenders_accumulate_severity() {
    let dir = TempDir::new().unwrap();
    let utxos = MemoryUtxoSet::new();
    let coin = unspent(&utxos, 1);
    let prison = Prison::load(dir.path().join("prison.txt"), Duration::hours(24), &utxos)
        .await
        .unwrap();

    let now = Utc::now();
    prison.ban_utxos(1, now, true, round(b"first"), [coin]).await.unwrap();
    let later = now + Duration::minutes(10);
    assert_eq!(prison.ban_utxos(2, later, true, round(b"second"), [coin]).await.unwrap(), 1);

    let entry = prison.try_get_banned_at(&coin, false, later).await.unwrap();
    assert_eq!(entry.severity, 3);
    assert!(!entry.is_noted);
    assert_eq!(entry.banned_for_round, round(b"second"));
    assert_eq!(entry.time_of_ban, later);
}

#[tokio::test]
async fn expired_bans_are_released() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prison.txt");
    let utxos = MemoryUtxoSet::new();
    let coin = unspent(&utxos, 1);
    let prison = Prison::load(&path, Duration::hours(1), &utxos).await.unwrap();

    let now = Utc::now();
    prison.ban_utxos(1, now, false, round(b"r"), [coin]).await.unwrap();
    assert!(prison.try_get_banned_at(&coin, false, now + Duration::minutes(59)).await.is_some());
    assert!(prison.try_get_banned_at(&coin, false, now + Duration::minutes(61)).await.is_none());
    assert_eq!(prison.count_banned().await, 0);
    assert!(std::fs::read_to_string(&path).unwrap().trim().is_empty());
}

#[tokio::test]
async fn unban_removes_the_entry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prison.txt");
    let utxos = MemoryUtxoSet::new();
    let (a, b) = (unspent(&utxos, 1), unspent(&utxos, 2));
    let prison = Prison::load(&path, Duration::hours(24), &utxos).await.unwrap();
    prison.ban_utxos(1, Utc::now(), false, round(b"r"), [a, b]).await.unwrap();

    assert!(prison.unban(&a).await.unwrap());
    assert!(!prison.unban(&a).await.unwrap());
    assert!(prison.try_get_banned(&a, true).await.is_none());

    let reloaded = Prison::load(&path, Duration::hours(24), &utxos).await.unwrap();
    let left: Vec<_> = reloaded.banned_utxos().await.into_iter().map(|b| b.outpoint).collect();
    assert_eq!(left, vec![b]);
}
