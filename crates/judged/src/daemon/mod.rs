//! Task loop
//!
//! Pulls tasks from the broker while a slot is free, runs each one in its own
//! tokio task, and settles every delivery exactly once. A delivery is acked
//! only after its slot was torn down cleanly and the result was published;
//! on any failure it is rejected for redelivery instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

pub use crate::daemon::pool::{SlotLease, SlotPool, SlotState};

mod pool;

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag};
use crate::runner::{Runner, StageError};
use crate::sandbox::{SandboxError, Workspace};
use crate::task::{ResultMessage, Task};
use crate::types::SlotId;

/// Pause after a failed broker read before trying again
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to reset slot {slot}: {source}")]
    SlotReset {
        slot: SlotId,
        #[source]
        source: SandboxError,
    },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Why a delivery was not acked
#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("stage panicked: {0}")]
    Panicked(String),

    #[error("teardown failed, result discarded: {0}")]
    Teardown(SandboxError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish result: {0}")]
    Publish(BrokerError),
}

/// The judge daemon: a slot pool fed by a broker
#[derive(Debug)]
pub struct Daemon {
    runner: Runner,
    broker: Arc<dyn Broker>,
    pool: Arc<SlotPool>,
}

impl Daemon {
    pub fn new(runner: Runner, broker: Arc<dyn Broker>, slots: u32) -> Self {
        Self {
            runner,
            broker,
            pool: SlotPool::new(slots.max(1)),
        }
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    /// Run until `shutdown` resolves or the broker stops delivering.
    ///
    /// Every slot is reset before the first task and torn down after the last
    /// in-flight task finishes.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), DaemonError> {
        self.reset_slots().await?;
        self.broker.set_prefetch(self.pool.capacity()).await?;
        info!(slots = self.pool.capacity(), "judge daemon started");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested, no longer accepting tasks");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "task worker failed");
                    }
                }
                delivery = self.broker.next_delivery(), if self.pool.free_count() > 0 => {
                    match delivery {
                        Ok(Some(delivery)) => self.dispatch(delivery, &mut tasks).await,
                        Ok(None) => {
                            info!("broker closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to receive task");
                            tokio::time::sleep(BROKER_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight tasks");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task worker failed");
            }
        }

        self.teardown_slots().await;
        info!("judge daemon stopped");
        Ok(())
    }

    async fn reset_slots(&self) -> Result<(), DaemonError> {
        for slot in self.pool.ids() {
            self.runner
                .sandbox()
                .teardown(slot)
                .await
                .map_err(|source| DaemonError::SlotReset { slot, source })?;
        }
        debug!("all slots reset");
        Ok(())
    }

    async fn teardown_slots(&self) {
        for slot in self.pool.ids() {
            if let Err(e) = self.runner.sandbox().teardown(slot).await {
                warn!(%slot, error = %e, "final teardown failed");
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, tasks: &mut JoinSet<()>) {
        let tag = delivery.tag;
        let task = match Task::from_slice(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(delivery = tag, error = %e, "undecodable task, dead-lettering");
                reject(self.broker.as_ref(), tag, false).await;
                return;
            }
        };

        let Some(lease) = self.pool.try_claim() else {
            error!(
                delivery = tag,
                submission_id = task.submission_id(),
                "task delivered with no free slot, scheduling contract violated"
            );
            reject(self.broker.as_ref(), tag, true).await;
            return;
        };

        let span = info_span!(
            "task",
            delivery = tag,
            attempt = delivery.attempt,
            slot = %lease.slot(),
            kind = task.kind(),
            submission_id = task.submission_id(),
            testcase_index = task.testcase_index(),
        );
        let runner = self.runner.clone();
        let broker = Arc::clone(&self.broker);
        tasks.spawn(process(runner, broker, lease, tag, task).instrument(span));
    }
}

/// Run one task in its slot and settle its delivery
async fn process(
    runner: Runner,
    broker: Arc<dyn Broker>,
    lease: SlotLease,
    tag: DeliveryTag,
    task: Task,
) {
    let slot = lease.slot();

    // A separate tokio task so a panicking stage still reaches teardown
    let stage = {
        let runner = runner.clone();
        let pool = Arc::clone(lease.pool());
        tokio::spawn(
            async move { run_stage(&runner, &pool, slot, &task).await }.instrument(Span::current()),
        )
    };
    let outcome = match stage.await {
        Ok(result) => result.map_err(TaskError::from),
        Err(e) => Err(TaskError::Panicked(e.to_string())),
    };

    lease.set_state(SlotState::TearingDown);
    let teardown = runner.sandbox().teardown(slot).await;
    lease.release();

    let settled = match (outcome, teardown) {
        (Ok(message), Ok(())) => publish(broker.as_ref(), &message).await,
        (Ok(_), Err(e)) => Err(TaskError::Teardown(e)),
        (Err(e), teardown) => {
            if let Err(teardown) = teardown {
                warn!(error = %teardown, "teardown after failure also failed");
            }
            Err(e)
        }
    };

    match settled {
        Ok(()) => {
            if let Err(e) = broker.ack(tag).await {
                error!(error = %e, "failed to ack published task");
            } else {
                info!("task completed");
            }
        }
        Err(e) => {
            error!(error = %e, "task failed, leaving it for redelivery");
            reject(broker.as_ref(), tag, true).await;
        }
    }
}

async fn run_stage(
    runner: &Runner,
    pool: &SlotPool,
    slot: SlotId,
    task: &Task,
) -> Result<ResultMessage, StageError> {
    pool.mark(slot, SlotState::Initializing);
    let root = runner.sandbox().initialize(slot).await?;
    pool.mark(slot, SlotState::Busy);

    let workspace = Workspace::new(slot, root);
    runner.execute(task, &workspace).await
}

async fn publish(broker: &dyn Broker, message: &ResultMessage) -> Result<(), TaskError> {
    let payload = message.to_vec()?;
    broker.publish(payload).await.map_err(TaskError::Publish)
}

async fn reject(broker: &dyn Broker, tag: DeliveryTag, requeue: bool) {
    if let Err(e) = broker.reject(tag, requeue).await {
        error!(delivery = tag, error = %e, "failed to reject delivery");
    }
}
