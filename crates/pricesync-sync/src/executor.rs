//! Applies pending updates one at a time (or with a bounded pool) and streams
//! what happens to each of them.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use pricesync_adapters::PriceUpdater;
use pricesync_core::{PendingUpdate, UpdateOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        index: usize,
        total: usize,
        sku: String,
    },
    Finished {
        index: usize,
        total: usize,
        outcome: UpdateOutcome,
    },
}

impl ExecutionEvent {
    pub fn index(&self) -> usize {
        match self {
            Self::Started { index, .. } | Self::Finished { index, .. } => *index,
        }
    }
}

#[derive(Clone)]
pub struct UpdateExecutor {
    updater: Arc<dyn PriceUpdater>,
    concurrency: usize,
}

impl UpdateExecutor {
    pub fn new(updater: Arc<dyn PriceUpdater>, concurrency: usize) -> Self {
        Self {
            updater,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dispatches updates in the given order, at most `concurrency` in flight.
    /// Each update is sent at most once. Events arrive in completion order; use
    /// [`ExecutionEvent::index`] to restore the input order.
    ///
    /// Dropping the stream stops dispatch of updates that have not started yet.
    /// Requests already in flight run to completion or to the client timeout.
    pub fn execute(&self, updates: Vec<PendingUpdate>) -> ReceiverStream<ExecutionEvent> {
        let total = updates.len();
        let (tx, rx) = mpsc::channel(self.concurrency * 2);
        let updater = Arc::clone(&self.updater);
        let concurrency = self.concurrency;

        tokio::spawn(async move {
            stream::iter(updates.into_iter().enumerate())
                .for_each_concurrent(concurrency, |(index, update)| {
                    let tx = tx.clone();
                    let updater = Arc::clone(&updater);
                    async move {
                        let started = ExecutionEvent::Started {
                            index,
                            total,
                            sku: update.sku.clone(),
                        };
                        if tx.send(started).await.is_err() {
                            debug!(index, sku = %update.sku, "event stream dropped; not dispatching");
                            return;
                        }
                        let outcome = updater.apply(&update).await;
                        let _ = tx
                            .send(ExecutionEvent::Finished {
                                index,
                                total,
                                outcome,
                            })
                            .await;
                    }
                })
                .await;
        });

        ReceiverStream::new(rx)
    }

    /// Runs every update and returns the outcomes in input order.
    pub async fn execute_all(&self, updates: Vec<PendingUpdate>) -> Vec<UpdateOutcome> {
        let mut finished: Vec<(usize, UpdateOutcome)> = self
            .execute(updates)
            .filter_map(|event| async move {
                match event {
                    ExecutionEvent::Finished { index, outcome, .. } => Some((index, outcome)),
                    ExecutionEvent::Started { .. } => None,
                }
            })
            .collect()
            .await;
        finished.sort_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}
