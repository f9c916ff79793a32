//! Directory-backed broker for single-host deployments
//!
//! Layout under the spool directory:
//! - `incoming/`: tasks waiting for delivery
//! - `claimed/`: tasks delivered and not yet settled
//! - `dead/`: dead-lettered tasks
//! - `results/`: published result messages
//!
//! A task file is named `<id>.json`, or `<id>~<n>.json` after `n` failed
//! deliveries. Files are written as `.part` and renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag};

const INCOMING: &str = "incoming";
const CLAIMED: &str = "claimed";
const DEAD: &str = "dead";
const RESULTS: &str = "results";

const EXTENSION: &str = ".json";
const PARTIAL_EXTENSION: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpoolName {
    id: String,
    failures: u32,
}

impl SpoolName {
    fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(EXTENSION)?;
        match stem.split_once('~') {
            Some((id, failures)) => Some(Self {
                id: id.to_string(),
                failures: failures.parse().ok()?,
            }),
            None => Some(Self {
                id: stem.to_string(),
                failures: 0,
            }),
        }
    }

    fn file_name(&self) -> String {
        if self.failures == 0 {
            format!("{}{EXTENSION}", self.id)
        } else {
            format!("{}~{}{EXTENSION}", self.id, self.failures)
        }
    }

    fn failed(&self) -> Self {
        Self {
            id: self.id.clone(),
            failures: self.failures + 1,
        }
    }
}

#[derive(Debug)]
struct Claim {
    name: SpoolName,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct State {
    claims: HashMap<DeliveryTag, Claim>,
    prefetch: u32,
    next_tag: DeliveryTag,
}

#[derive(Debug)]
pub struct SpoolBroker {
    root: PathBuf,
    poll_interval: Duration,
    max_deliveries: u32,
    state: Mutex<State>,
    sequence: AtomicU64,
}

impl SpoolBroker {
    /// Open a spool, creating its directories and returning crashed claims to
    /// `incoming/` (each counted as a failed delivery)
    pub async fn open(
        root: impl Into<PathBuf>,
        poll_interval: Duration,
        max_deliveries: u32,
    ) -> Result<Self, BrokerError> {
        let root = root.into();
        for dir in [INCOMING, CLAIMED, DEAD, RESULTS] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let broker = Self {
            root,
            poll_interval,
            max_deliveries: max_deliveries.max(1),
            state: Mutex::new(State::default()),
            sequence: AtomicU64::new(0),
        };
        broker.recover_claims().await?;
        Ok(broker)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn recover_claims(&self) -> Result<(), BrokerError> {
        let mut entries = tokio::fs::read_dir(self.root.join(CLAIMED)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().and_then(SpoolName::parse) else {
                continue;
            };
            warn!(file = %name.file_name(), "recovering task claimed by a previous run");
            self.settle_failed(&entry.path(), &name, true).await?;
        }
        Ok(())
    }

    /// A name unique to this process that sorts by creation time
    fn unique_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:024}-{}-{seq:06}", std::process::id())
    }

    async fn write_atomic(
        &self,
        dir: &str,
        file_name: &str,
        payload: &[u8],
    ) -> Result<PathBuf, BrokerError> {
        let dest = self.root.join(dir).join(file_name);
        let partial = self
            .root
            .join(dir)
            .join(format!("{file_name}{PARTIAL_EXTENSION}"));
        tokio::fs::write(&partial, payload).await?;
        tokio::fs::rename(&partial, &dest).await?;
        Ok(dest)
    }

    /// Drop a task into `incoming/`
    pub async fn enqueue(&self, payload: &[u8]) -> Result<PathBuf, BrokerError> {
        let name = SpoolName {
            id: self.unique_id(),
            failures: 0,
        };
        let path = self.write_atomic(INCOMING, &name.file_name(), payload).await?;
        debug!(?path, "enqueued task");
        Ok(path)
    }

    /// Claim the oldest incoming task.
    ///
    /// Uses blocking filesystem calls so no await point separates the claiming
    /// rename from recording the claim.
    fn try_claim(&self, state: &mut State) -> Result<Option<Delivery>, BrokerError> {
        let incoming = std::fs::read_dir(self.root.join(INCOMING))?;
        let mut candidates: Vec<(SpoolName, String)> = incoming
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|file| SpoolName::parse(&file).map(|name| (name, file)))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        for (name, file) in candidates {
            let source = self.root.join(INCOMING).join(&file);
            let claimed = self.root.join(CLAIMED).join(&file);
            match std::fs::rename(&source, &claimed) {
                Ok(()) => {}
                // Claimed by another consumer in the meantime
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let payload = match std::fs::read(&claimed) {
                Ok(payload) => payload,
                Err(e) => {
                    let _ = std::fs::rename(&claimed, &source);
                    return Err(e.into());
                }
            };

            state.next_tag += 1;
            let tag = state.next_tag;
            let attempt = name.failures + 1;
            state.claims.insert(
                tag,
                Claim {
                    name,
                    path: claimed,
                },
            );
            return Ok(Some(Delivery {
                tag,
                payload,
                attempt,
            }));
        }
        Ok(None)
    }

    async fn settle_failed(
        &self,
        path: &Path,
        name: &SpoolName,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let failed = name.failed();
        if requeue && failed.failures < self.max_deliveries {
            let dest = self.root.join(INCOMING).join(failed.file_name());
            tokio::fs::rename(path, &dest).await?;
            debug!(?dest, "requeued task");
        } else {
            let dest = self.root.join(DEAD).join(name.file_name());
            tokio::fs::rename(path, &dest).await?;
            warn!(?dest, failures = failed.failures, "dead-lettered task");
        }
        Ok(())
    }

    async fn take_claim(&self, tag: DeliveryTag) -> Result<Claim, BrokerError> {
        self.state
            .lock()
            .await
            .claims
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Broker for SpoolBroker {
    async fn set_prefetch(&self, count: u32) -> Result<(), BrokerError> {
        self.state.lock().await.prefetch = count;
        info!(prefetch = count, "spool prefetch set");
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            {
                let mut state = self.state.lock().await;
                let has_credit =
                    state.prefetch == 0 || state.claims.len() < state.prefetch as usize;
                if has_credit && let Some(delivery) = self.try_claim(&mut state)? {
                    return Ok(Some(delivery));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    #[instrument(skip(self, payload))]
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        let file_name = format!("{}{EXTENSION}", self.unique_id());
        let path = self.write_atomic(RESULTS, &file_name, &payload).await?;
        debug!(?path, "published result");
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let claim = self.take_claim(tag).await?;
        tokio::fs::remove_file(&claim.path).await?;
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let claim = self.take_claim(tag).await?;
        self.settle_failed(&claim.path, &claim.name, requeue).await
    }
}
