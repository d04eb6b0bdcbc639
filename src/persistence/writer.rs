use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::engine::SubscriptionRecord;
use crate::persistence::sled_store::{MessageRecord, MessageStore};
use crate::raft::state::LogEntry;
use crate::utils::error::BrokerError;

/// Consecutive failed batch attempts before the fault flag is raised and the
/// Raft core starts refusing leadership.
const FAULT_THRESHOLD: u32 = 8;
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// A single mutation of the durable store.
#[derive(Debug)]
pub enum WriteCommand {
    AppendMessage(MessageRecord),
    SaveRaftMeta {
        term: u64,
        voted_for: Option<String>,
    },
    AppendRaftEntries(Vec<LogEntry>),
    TruncateRaftLog {
        from_index: u64,
    },
    SetLastApplied(u64),
    SaveSubscription(SubscriptionRecord),
    RemoveSubscription {
        subscriber_id: String,
        topic: String,
    },
}

/// What a durable write produced. `Seq` carries the store-assigned sequence
/// for message appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Done,
    Seq(u64),
}

struct WriteJob {
    cmd: WriteCommand,
    ack: Option<oneshot::Sender<Result<WriteOutcome, BrokerError>>>,
}

/// Handle for submitting writes to the serializer.
///
/// `submit` is the blocking path: it waits for queue capacity and then for
/// durability, so callers that must not drop (the Raft apply loop, vote and
/// log persistence) cannot lose a write. `try_submit` is fire-and-forget and
/// surfaces `Backpressure` instead of waiting.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteJob>,
    fault: Arc<AtomicBool>,
}

impl WriterHandle {
    /// Enqueues a write and waits until it is durable on disk.
    pub async fn submit(&self, cmd: WriteCommand) -> Result<WriteOutcome, BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let job = WriteJob {
            cmd,
            ack: Some(ack_tx),
        };
        self.tx.send(job).await.map_err(|_| {
            BrokerError::StorageUnavailable("write serializer has stopped".to_string())
        })?;
        ack_rx.await.map_err(|_| {
            BrokerError::StorageUnavailable("write serializer dropped the request".to_string())
        })?
    }

    /// Enqueues a write without waiting for durability. Fails fast with
    /// `Backpressure` when the queue is full.
    pub fn try_submit(&self, cmd: WriteCommand) -> Result<(), BrokerError> {
        let job = WriteJob { cmd, ack: None };
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BrokerError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                BrokerError::StorageUnavailable("write serializer has stopped".to_string())
            }
        })
    }

    /// True while the store has been failing long enough that the node must
    /// not accept new writes or hold leadership.
    pub fn is_faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }
}

/// Spawns the single consumer task and returns the submission handle.
///
/// The consumer drains up to `batch_size` queued requests at a time, applies
/// them in FIFO order, flushes once per batch, and only then acknowledges.
/// Batches never reorder: within a batch the original enqueue order is kept.
pub fn spawn_write_serializer(
    store: Arc<MessageStore>,
    queue_capacity: usize,
    batch_size: usize,
    shutdown: CancellationToken,
) -> WriterHandle {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let fault = Arc::new(AtomicBool::new(false));
    let handle = WriterHandle {
        tx,
        fault: fault.clone(),
    };

    tokio::spawn(run_serializer(
        store,
        rx,
        batch_size.max(1),
        fault,
        shutdown,
    ));

    handle
}

async fn run_serializer(
    store: Arc<MessageStore>,
    mut rx: mpsc::Receiver<WriteJob>,
    batch_size: usize,
    fault: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            job = rx.recv() => job,
            _ = shutdown.cancelled() => {
                drain_on_shutdown(&store, &mut rx).await;
                return;
            }
        };
        let Some(first) = first else {
            return;
        };

        let mut batch = vec![first];
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }

        apply_batch(&store, batch, &fault, &shutdown).await;
    }
}

/// Applies one batch, retrying with exponential backoff until it sticks.
///
/// Already-applied commands within the batch are not re-applied on retry, so
/// a failure after a partial apply cannot double-append.
async fn apply_batch(
    store: &MessageStore,
    batch: Vec<WriteJob>,
    fault: &AtomicBool,
    shutdown: &CancellationToken,
) {
    let mut results: Vec<Option<WriteOutcome>> = (0..batch.len()).map(|_| None).collect();
    let mut attempt: u32 = 0;

    loop {
        let mut failure: Option<BrokerError> = None;
        for (i, job) in batch.iter().enumerate() {
            if results[i].is_some() {
                continue;
            }
            match apply_command(store, &job.cmd) {
                Ok(outcome) => results[i] = Some(outcome),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Err(err) = store.flush().await {
                failure = Some(err);
            }
        }

        match failure {
            None => {
                if fault.swap(false, Ordering::AcqRel) {
                    info!("durable store recovered, clearing fault flag");
                }
                for (job, outcome) in batch.into_iter().zip(results) {
                    if let Some(ack) = job.ack {
                        // Receiver may have given up waiting; that is fine.
                        let _ = ack.send(Ok(outcome.unwrap_or(WriteOutcome::Done)));
                    }
                }
                return;
            }
            Some(err) => {
                attempt += 1;
                if attempt == FAULT_THRESHOLD {
                    fault.store(true, Ordering::Release);
                    error!(error = %err, "durable store persistently failing, node entering read-only state");
                } else {
                    warn!(error = %err, attempt, "durable write failed, retrying");
                }
                let backoff = BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt.min(16)))
                    .min(BACKOFF_CAP);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

/// Best-effort final drain so a graceful shutdown does not abandon queued
/// writes. No retries here; the process is exiting.
async fn drain_on_shutdown(store: &MessageStore, rx: &mut mpsc::Receiver<WriteJob>) {
    let mut drained = 0usize;
    while let Ok(job) = rx.try_recv() {
        let outcome = apply_command(store, &job.cmd);
        if let Some(ack) = job.ack {
            let _ = ack.send(outcome);
        }
        drained += 1;
    }
    if let Err(err) = store.flush().await {
        warn!(error = %err, "final flush failed during shutdown");
    }
    if drained > 0 {
        info!(drained, "write queue drained on shutdown");
    }
}

fn apply_command(store: &MessageStore, cmd: &WriteCommand) -> Result<WriteOutcome, BrokerError> {
    match cmd {
        WriteCommand::AppendMessage(record) => store.append_message(record).map(WriteOutcome::Seq),
        WriteCommand::SaveRaftMeta { term, voted_for } => store
            .save_raft_meta(*term, voted_for.as_deref())
            .map(|_| WriteOutcome::Done),
        WriteCommand::AppendRaftEntries(entries) => store
            .append_raft_entries(entries)
            .map(|_| WriteOutcome::Done),
        WriteCommand::TruncateRaftLog { from_index } => store
            .truncate_raft_log_from(*from_index)
            .map(|_| WriteOutcome::Done),
        WriteCommand::SetLastApplied(index) => {
            store.save_last_applied(*index).map(|_| WriteOutcome::Done)
        }
        WriteCommand::SaveSubscription(record) => {
            store.save_subscription(record).map(|_| WriteOutcome::Done)
        }
        WriteCommand::RemoveSubscription {
            subscriber_id,
            topic,
        } => store
            .remove_subscription(subscriber_id, topic)
            .map(|_| WriteOutcome::Done),
    }
}
