//! Ban list for inputs that disrupted rounds.
//!
//! One line per entry in `prison.txt`:
//! `<unix seconds>:<severity>:<output index>:<txid>:<noted>:<round id>`.
//! New entries are appended, any change to an existing entry rewrites the
//! file. The map and the file are only touched under the prison's lock.

use crate::core::types::*;
use crate::utxo::UtxoProvider;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BannedUtxo {
    pub outpoint: OutPoint,
    pub severity: u32,
    pub time_of_ban: DateTime<Utc>,
    /// Soft ban: recorded, enforced only when noted inputs are refused.
    pub is_noted: bool,
    pub banned_for_round: RoundId,
}

impl BannedUtxo {
    pub fn expires_at(&self, ban_duration: Duration) -> DateTime<Utc> {
        self.time_of_ban + ban_duration
    }

    pub fn is_expired(&self, ban_duration: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at(ban_duration) < now
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split(':').collect();
        if parts.len() != 6 {
            bail!("expected 6 fields, found {}", parts.len());
        }
        let secs: i64 = parts[0].parse().context("time of ban")?;
        let time_of_ban = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("time of ban out of range"))?;
        let is_noted = match parts[4] {
            "true" | "True" => true,
            "false" | "False" => false,
            other => bail!("bad noted flag '{}'", other),
        };
        Ok(Self {
            outpoint: OutPoint::new(parts[3].parse().context("txid")?, parts[2].parse().context("index")?),
            severity: parts[1].parse().context("severity")?,
            time_of_ban,
            is_noted,
            banned_for_round: parts[5].parse().context("round id")?,
        })
    }
}

impl fmt::Display for BannedUtxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.time_of_ban.timestamp(),
            self.severity,
            self.outpoint.index,
            self.outpoint.txid,
            self.is_noted,
            self.banned_for_round
        )
    }
}

pub struct Prison {
    path: PathBuf,
    ban_duration: Duration,
    inmates: Mutex<HashMap<OutPoint, BannedUtxo>>,
}

impl Prison {
    /// Read the ban file, dropping malformed lines, expired bans and
    /// outpoints that are no longer unspent.
    pub async fn load(path: impl AsRef<Path>, ban_duration: Duration, utxo: &dyn UtxoProvider) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inmates = HashMap::new();
        let mut dropped = 0usize;
        if path.exists() {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let now = Utc::now();
            for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                match BannedUtxo::parse_line(line) {
                    Ok(b) if b.is_expired(ban_duration, now) || !utxo.is_unspent(&b.outpoint) => dropped += 1,
                    Ok(b) => {
                        inmates.insert(b.outpoint, b);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping prison line {}: {}", n + 1, e);
                        dropped += 1;
                    }
                }
            }
        }
        let prison = Self {
            path,
            ban_duration,
            inmates: Mutex::new(inmates),
        };
        if dropped > 0 {
            let inmates = prison.inmates.lock().await;
            prison.rewrite(&inmates).await?;
            tracing::info!("Pruned {} stale prison entries", dropped);
        }
        tracing::info!(
            "Prison loaded: {} entries from {}",
            prison.inmates.lock().await.len(),
            prison.path.display()
        );
        Ok(prison)
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    /// Record a punishment. Banning again for the same round with the same
    /// noted flag changes nothing; noted entries of that round are upgraded.
    /// An offense in a new round adds to the severity and turns a noted
    /// entry into a ban. Returns how many entries changed.
    pub async fn ban_utxos(
        &self,
        severity: u32,
        time: DateTime<Utc>,
        force_noted: bool,
        round_id: RoundId,
        outpoints: impl IntoIterator<Item = OutPoint>,
    ) -> Result<usize> {
        let mut inmates = self.inmates.lock().await;
        let mut appended = Vec::new();
        let mut updated = 0usize;
        for outpoint in outpoints {
            match inmates.get_mut(&outpoint) {
                None => {
                    let entry = BannedUtxo {
                        outpoint,
                        severity,
                        time_of_ban: time,
                        is_noted: force_noted,
                        banned_for_round: round_id,
                    };
                    appended.push(entry.clone());
                    inmates.insert(outpoint, entry);
                }
                Some(existing) if existing.banned_for_round == round_id => {
                    if existing.is_noted && !force_noted {
                        existing.is_noted = false;
                        existing.time_of_ban = time;
                        existing.severity = existing.severity.max(severity);
                        updated += 1;
                    }
                }
                Some(existing) => {
                    existing.severity = existing.severity.saturating_add(severity);
                    existing.time_of_ban = time;
                    existing.is_noted = false;
                    existing.banned_for_round = round_id;
                    updated += 1;
                }
            }
        }

        if updated > 0 {
            self.rewrite(&inmates).await?;
        } else if !appended.is_empty() {
            self.append(&appended).await?;
        }
        let changed = updated + appended.len();
        if changed > 0 {
            tracing::warn!(
                "Round {}: {} UTXO(s) {} with severity {}",
                round_id.short(),
                changed,
                if force_noted { "noted" } else { "banned" },
                severity
            );
        }
        Ok(changed)
    }

    pub async fn try_get_banned(&self, outpoint: &OutPoint, include_noted: bool) -> Option<BannedUtxo> {
        self.try_get_banned_at(outpoint, include_noted, Utc::now()).await
    }

    /// Expired entries are released and the file rewritten.
    pub async fn try_get_banned_at(
        &self,
        outpoint: &OutPoint,
        include_noted: bool,
        now: DateTime<Utc>,
    ) -> Option<BannedUtxo> {
        let mut inmates = self.inmates.lock().await;
        let entry = inmates.get(outpoint)?.clone();
        if entry.is_expired(self.ban_duration, now) {
            inmates.remove(outpoint);
            tracing::info!("Released {:?} from prison", outpoint);
            if let Err(e) = self.rewrite(&inmates).await {
                tracing::error!("Failed to persist prison release: {}", e);
            }
            return None;
        }
        (include_noted || !entry.is_noted).then_some(entry)
    }

    pub async fn unban(&self, outpoint: &OutPoint) -> Result<bool> {
        let mut inmates = self.inmates.lock().await;
        if inmates.remove(outpoint).is_none() {
            return Ok(false);
        }
        self.rewrite(&inmates).await?;
        Ok(true)
    }

    pub async fn count_banned(&self) -> usize {
        self.inmates.lock().await.values().filter(|b| !b.is_noted).count()
    }

    pub async fn count_noted(&self) -> usize {
        self.inmates.lock().await.values().filter(|b| b.is_noted).count()
    }

    /// Snapshot ordered by ban time.
    pub async fn banned_utxos(&self) -> Vec<BannedUtxo> {
        let mut all: Vec<_> = self.inmates.lock().await.values().cloned().collect();
        all.sort_by_key(|b| (b.time_of_ban, b.outpoint));
        all
    }

    async fn append(&self, entries: &[BannedUtxo]) -> Result<()> {
        self.ensure_parent().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut text = String::new();
        for e in entries {
            text.push_str(&e.to_string());
            text.push('\n');
        }
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rewrite(&self, inmates: &HashMap<OutPoint, BannedUtxo>) -> Result<()> {
        self.ensure_parent().await?;
        let mut entries: Vec<_> = inmates.values().collect();
        entries.sort_by_key(|b| (b.time_of_ban, b.outpoint));
        let mut text = String::new();
        for e in entries {
            text.push_str(&e.to_string());
            text.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::MemoryUtxoSet;
    use tempfile::TempDir;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid(hash(&[n])), n as u32)
    }

    #[test]
    fn line_format_round_trips() {
        let entry = BannedUtxo {
            outpoint: outpoint(3),
            severity: 2,
            time_of_ban: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            is_noted: true,
            banned_for_round: RoundId(hash(b"r")),
        };
        let line = entry.to_string();
        assert!(line.starts_with("1700000000:2:3:"));
        assert_eq!(BannedUtxo::parse_line(&line).unwrap(), entry);
        assert!(BannedUtxo::parse_line("1:2:3").is_err());
    }

    #[tokio::test]
    async fn same_round_reban_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let utxos = MemoryUtxoSet::new();
        let prison = Prison::load(dir.path().join("prison.txt"), Duration::hours(24), &utxos)
            .await
            .unwrap();
        let round = RoundId(hash(b"round"));
        let now = Utc::now();
        assert_eq!(prison.ban_utxos(1, now, true, round, [outpoint(1)]).await.unwrap(), 1);
        assert_eq!(prison.ban_utxos(1, now, true, round, [outpoint(1)]).await.unwrap(), 0);
        assert_eq!(prison.count_noted().await, 1);

        assert_eq!(prison.ban_utxos(1, now, false, round, [outpoint(1)]).await.unwrap(), 1);
        assert_eq!(prison.count_noted().await, 0);
        assert_eq!(prison.count_banned().await, 1);
    }

    #[tokio::test]
    async fn noted_entries_are_filtered() {
        let dir = TempDir::new().unwrap();
        let utxos = MemoryUtxoSet::new();
        let prison = Prison::load(dir.path().join("prison.txt"), Duration::hours(24), &utxos)
            .await
            .unwrap();
        prison
            .ban_utxos(1, Utc::now(), true, RoundId(hash(b"r")), [outpoint(1)])
            .await
            .unwrap();
        assert!(prison.try_get_banned(&outpoint(1), false).await.is_none());
        assert!(prison.try_get_banned(&outpoint(1), true).await.is_some());
        assert!(prison.try_get_banned(&outpoint(2), true).await.is_none());
    }
}
