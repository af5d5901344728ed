//! Chain view used to admit inputs and to notice coins spent mid-round.
//!
//! Talking to a full node is someone else's job; the coordinator only needs
//! point lookups. [`MemoryUtxoSet`] backs tests and the `utxos.json` file
//! the binary loads at startup.

use crate::core::types::*;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub txout: TxOut,
    pub confirmations: u32,
}

pub trait UtxoProvider: Send + Sync {
    /// `None` when the outpoint is unknown or already spent.
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.get_utxo(outpoint).is_some()
    }
}

#[derive(Serialize, Deserialize)]
struct UtxoRecord {
    outpoint: OutPoint,
    value: u64,
    script_pubkey: ScriptPubKey,
    #[serde(default = "default_confirmations")]
    confirmations: u32,
}

fn default_confirmations() -> u32 {
    1
}

#[derive(Default)]
pub struct MemoryUtxoSet {
    entries: RwLock<HashMap<OutPoint, UtxoEntry>>,
}

impl MemoryUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of `{outpoint, value, script_pubkey, confirmations}`.
    /// A missing file yields an empty set.
    pub fn load_json(path: &Path) -> Result<Self> {
        let set = Self::new();
        if !path.exists() {
            tracing::warn!("No UTXO file at {}, starting with an empty set", path.display());
            return Ok(set);
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<UtxoRecord> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for r in records {
            set.insert(
                r.outpoint,
                TxOut {
                    value: r.value,
                    script_pubkey: r.script_pubkey,
                },
                r.confirmations,
            );
        }
        tracing::info!("Loaded {} UTXOs from {}", set.len(), path.display());
        Ok(set)
    }

    pub fn insert(&self, outpoint: OutPoint, txout: TxOut, confirmations: u32) {
        self.entries
            .write()
            .insert(outpoint, UtxoEntry { txout, confirmations });
    }

    pub fn spend(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.write().remove(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl UtxoProvider for MemoryUtxoSet {
    fn get_utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.read().get(outpoint).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_records_and_tracks_spends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("utxos.json");
        let op = OutPoint::new(Txid(hash(b"funding")), 1);
        let json = format!(
            r#"[{{"outpoint":{},"value":50000,"script_pubkey":"{}"}}]"#,
            serde_json::to_string(&op).unwrap(),
            ScriptPubKey::p2wpkh(&[2u8; 33])
        );
        std::fs::write(&path, json).unwrap();

        let set = MemoryUtxoSet::load_json(&path).unwrap();
        let entry = set.get_utxo(&op).unwrap();
        assert_eq!(entry.txout.value, 50_000);
        assert_eq!(entry.confirmations, 1);

        set.spend(&op);
        assert!(!set.is_unspent(&op));
        assert!(set.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let set = MemoryUtxoSet::load_json(&dir.path().join("none.json")).unwrap();
        assert_eq!(set.len(), 0);
    }
}
