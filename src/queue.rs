//! Commit queue worker that owns the aggregate and applies requests one at a
//! time.
//!
//! The worker runs as a tokio task and drains an `mpsc` channel in order.
//! It is the only code that mutates the in-memory aggregate or writes the
//! transaction log, so commits, rollbacks, and imports against one
//! transactor never overlap and always apply in the order they were queued.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::Storable;
use crate::error::{CommitError, StorageError};
use crate::fold::Fold;
use crate::log_store::LogStore;
use crate::publish::Publisher;
use crate::transaction::Transaction;

/// Channel the worker answers a request on.
pub(crate) type Reply<P> = oneshot::Sender<Result<P, CommitError>>;

/// Computes a transaction from the latest committed aggregate.
pub(crate) type Generator<D, P> = Box<dyn FnOnce(&P) -> D + Send>;

/// Where a commit's transaction data comes from.
pub(crate) enum Source<D, P> {
    /// Data fixed at submission time.
    Data(D),
    /// Data computed inside the queue from the aggregate current at that
    /// point, so read-modify-write commits never lose updates.
    Generate(Generator<D, P>),
}

/// Work items sent from `Transactor` handles to the worker.
pub(crate) enum Request<D, P> {
    /// Persist and fold one transaction.
    Commit { source: Source<D, P>, reply: Reply<P> },
    /// Drop every transaction newer than `id`, then rebuild.
    RollbackAfter { id: Uuid, reply: Reply<P> },
    /// Drop `id` and every transaction newer than it, then rebuild.
    RollbackBefore { id: Uuid, reply: Reply<P> },
    /// Replace the log from a file, then rebuild.
    Import { file: PathBuf, reply: Reply<P> },
}

impl<D, P> Request<D, P> {
    fn name(&self) -> &'static str {
        match self {
            Self::Commit { .. } => "commit",
            Self::RollbackAfter { .. } => "rollback_after",
            Self::RollbackBefore { .. } => "rollback_before",
            Self::Import { .. } => "import",
        }
    }

    fn reject(self, error: CommitError) {
        let (Self::Commit { reply, .. }
        | Self::RollbackAfter { reply, .. }
        | Self::RollbackBefore { reply, .. }
        | Self::Import { reply, .. }) = self;
        // The caller may have stopped waiting.
        let _ = reply.send(Err(error));
    }
}

/// Whether the queue may keep running after a request.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Continue,
    /// The aggregate may no longer match the log.
    Abort,
}

/// Load the whole log and fold it, oldest first, over `base`.
///
/// # Errors
///
/// Returns the log store's error if the log cannot be read or decoded.
pub(crate) async fn replay<D: Storable, P: Clone>(
    log: &LogStore<Transaction<D>>,
    fold: &Fold<D, P>,
    base: &P,
) -> Result<P, StorageError> {
    let history: Vec<D> = log
        .load()
        .await?
        .into_iter()
        .rev()
        .map(|record| record.data)
        .collect();

    let post = fold.rebuild(base, &history);
    tracing::debug!(key = log.key(), count = history.len(), "log replayed");
    Ok(post)
}

/// State owned by the queue worker.
pub(crate) struct Worker<D: Storable, P> {
    pub base: P,
    pub current: P,
    pub log: Arc<LogStore<Transaction<D>>>,
    pub fold: Fold<D, P>,
    pub publisher: Arc<Publisher<P>>,
    pub commit_timeout: Option<Duration>,
}

impl<D: Storable, P: Clone + Send + Sync + 'static> Worker<D, P> {
    async fn handle(&mut self, request: Request<D, P>) -> Outcome {
        match request {
            Request::Commit { source, reply } => {
                let data = match source {
                    Source::Data(data) => data,
                    Source::Generate(generate) => generate(&self.current),
                };
                let (result, outcome) = self.commit(data).await;
                let _ = reply.send(result);
                outcome
            }
            Request::RollbackAfter { id, reply } => {
                let truncated = self.log.delete_after(id).await;
                self.rebuild_after(truncated, reply).await
            }
            Request::RollbackBefore { id, reply } => {
                let truncated = self.log.delete_including(id).await;
                self.rebuild_after(truncated, reply).await
            }
            Request::Import { file, reply } => {
                let imported = self.log.import_data(&file).await;
                self.rebuild_after(imported, reply).await
            }
        }
    }

    /// Persist `data` and fold it into the aggregate concurrently; publish
    /// only once the persist has succeeded.
    async fn commit(&mut self, data: D) -> (Result<P, CommitError>, Outcome) {
        let record = Transaction::new(data);
        let id = record.id;

        let persist = async {
            let append = self.log.append(record.clone());
            match self.commit_timeout {
                Some(limit) => tokio::time::timeout(limit, append)
                    .await
                    .map_err(|_elapsed| CommitError::TimedOut(limit)),
                None => Ok(append.await),
            }
        };
        let reduce = async { self.fold.apply(&record.data, self.current.clone()) };
        let (persisted, candidate) = tokio::join!(persist, reduce);

        match persisted {
            Ok(Ok(())) => {
                self.current = candidate.clone();
                self.publisher.publish(candidate.clone());
                tracing::info!(
                    %id,
                    subscribers = self.publisher.subscriber_count(),
                    "transaction committed"
                );
                (Ok(candidate), Outcome::Continue)
            }
            Ok(Err(e)) => {
                tracing::warn!(%id, error = %e, "persist failed, commit dropped");
                (Err(CommitError::Storage(e)), Outcome::Continue)
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "persist timed out");
                (Err(e), Outcome::Abort)
            }
        }
    }

    /// Finish a rollback or import: if the log rewrite succeeded, rebuild
    /// from `base` and publish.
    ///
    /// A rewrite that failed left the log untouched, so the queue carries
    /// on. A rebuild that fails after a successful rewrite leaves the
    /// aggregate stale against the log, so the queue is aborted.
    async fn rebuild_after(
        &mut self,
        rewritten: Result<(), StorageError>,
        reply: Reply<P>,
    ) -> Outcome {
        if let Err(e) = rewritten {
            tracing::warn!(error = %e, "log rewrite failed, aggregate unchanged");
            let _ = reply.send(Err(e.into()));
            return Outcome::Continue;
        }

        match replay(&self.log, &self.fold, &self.base).await {
            Ok(post) => {
                self.current = post.clone();
                self.publisher.publish(post.clone());
                let _ = reply.send(Ok(post));
                Outcome::Continue
            }
            Err(e) => {
                tracing::error!(error = %e, "rebuild after log rewrite failed");
                let _ = reply.send(Err(e.into()));
                Outcome::Abort
            }
        }
    }
}

/// Run the commit queue until every sender is dropped or a request aborts
/// it.
///
/// On abort the channel is closed and every request still queued is
/// answered with [`CommitError::Aborted`] before the worker exits.
pub(crate) async fn run_queue<D, P>(
    mut worker: Worker<D, P>,
    mut rx: mpsc::Receiver<Request<D, P>>,
) where
    D: Storable,
    P: Clone + Send + Sync + 'static,
{
    let key = worker.log.key().to_owned();

    while let Some(request) = rx.recv().await {
        let span = tracing::info_span!("commit", key = %key, op = request.name());
        let outcome = worker.handle(request).instrument(span).await;

        if outcome == Outcome::Abort {
            rx.close();
            let mut dropped = 0usize;
            while let Some(request) = rx.recv().await {
                request.reject(CommitError::Aborted);
                dropped += 1;
            }
            tracing::error!(key = %key, dropped, "commit queue aborted");
            return;
        }
    }

    tracing::debug!(key = %key, "commit queue closed");
}
