//! Getting the finished coinjoin out. Layers are tried in order; each
//! failure is logged and the next layer gets its chance.

use crate::core::JoinTransaction;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    fn name(&self) -> String;

    async fn broadcast(&self, tx: &JoinTransaction) -> Result<()>;
}

pub struct FallbackBroadcaster {
    layers: Vec<Box<dyn Broadcaster>>,
}

impl FallbackBroadcaster {
    pub fn new(layers: Vec<Box<dyn Broadcaster>>) -> Self {
        Self { layers }
    }
}

#[async_trait]
impl Broadcaster for FallbackBroadcaster {
    fn name(&self) -> String {
        format!("fallback[{}]", self.layers.len())
    }

    async fn broadcast(&self, tx: &JoinTransaction) -> Result<()> {
        let txid = tx.txid();
        for layer in &self.layers {
            match layer.broadcast(tx).await {
                Ok(()) => {
                    tracing::info!("Broadcast {} via {}", txid.short(), layer.name());
                    return Ok(());
                }
                Err(e) => tracing::warn!("Broadcast of {} via {} failed: {:#}", txid.short(), layer.name(), e),
            }
        }
        bail!("all {} broadcast layers failed for {}", self.layers.len(), txid)
    }
}

/// POSTs `{"txid", "hex"}` to a relay endpoint.
pub struct HttpRelayBroadcaster {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRelayBroadcaster {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl Broadcaster for HttpRelayBroadcaster {
    fn name(&self) -> String {
        self.endpoint.clone()
    }

    async fn broadcast(&self, tx: &JoinTransaction) -> Result<()> {
        let body = serde_json::json!({
            "txid": tx.txid().to_string(),
            "hex": tx.to_hex(),
        });
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        if !resp.status().is_success() {
            bail!("relay answered {}", resp.status());
        }
        Ok(())
    }
}

/// Last resort: drop `<txid>.hex` into a directory for an operator to relay.
pub struct FileBroadcaster {
    dir: PathBuf,
}

impl FileBroadcaster {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Broadcaster for FileBroadcaster {
    fn name(&self) -> String {
        format!("file:{}", self.dir.display())
    }

    async fn broadcast(&self, tx: &JoinTransaction) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.hex", tx.txid()));
        tokio::fs::write(&path, tx.to_hex())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Failing(Arc<AtomicUsize>);

    #[async_trait]
    impl Broadcaster for Failing {
        fn name(&self) -> String {
            "failing".into()
        }

        async fn broadcast(&self, _tx: &JoinTransaction) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            bail!("peer unreachable")
        }
    }

    fn empty_tx() -> JoinTransaction {
        JoinTransaction::unsigned(std::iter::empty(), std::iter::empty())
    }

    #[tokio::test]
    async fn falls_through_to_file() {
        let dir = TempDir::new().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let b = FallbackBroadcaster::new(vec![
            Box::new(Failing(attempts.clone())),
            Box::new(Failing(attempts.clone())),
            Box::new(FileBroadcaster::new(dir.path())),
        ]);
        let tx = empty_tx();
        b.broadcast(&tx).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(dir.path().join(format!("{}.hex", tx.txid())).exists());
    }

    #[tokio::test]
    async fn fails_only_when_every_layer_fails() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let b = FallbackBroadcaster::new(vec![Box::new(Failing(attempts.clone()))]);
        assert!(b.broadcast(&empty_tx()).await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
