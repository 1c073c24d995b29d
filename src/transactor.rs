//! The transactor: a log of transactions, the aggregate folded from it, and
//! the commit queue that keeps the two in step.
//!
//! Public API: [`Transactor`] (cloneable async handle),
//! [`TransactorBuilder`] (opens the log, replays it, and starts the queue
//! worker), [`TransactorConfig`], and [`PendingCommit`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::backend::{Bytes, Storable, StorageBackend, StorageLocation};
use crate::error::{CommitError, StorageError};
use crate::fold::{Aggregate, FlattenFn, Fold, ReduceFn, reducer};
use crate::key::StorageKey;
use crate::log_store::LogStore;
use crate::memory::MemoryTable;
use crate::publish::{Publisher, Subscription};
use crate::queue::{self, Reply, Request, Source, Worker};
use crate::transaction::Transaction;
use crate::value_store::ValueStore;

/// Key used when the builder is given none.
const DEFAULT_KEY: &str = "transactions-generic";

/// Tuning for a [`Transactor`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use foldlog::TransactorConfig;
///
/// let config = TransactorConfig {
///     commit_timeout: Some(Duration::from_secs(5)),
///     ..TransactorConfig::default()
/// };
/// assert_eq!(config.queue_capacity, 32);
/// assert!(!config.cached);
/// ```
#[derive(Debug, Clone)]
pub struct TransactorConfig {
    /// How many requests may wait in the commit queue before submitters
    /// start waiting for room.
    ///
    /// Default: 32.
    pub queue_capacity: usize,

    /// How many published aggregates a slow subscriber may fall behind
    /// before it skips ahead.
    ///
    /// Default: 256.
    pub publish_capacity: usize,

    /// Upper bound on one persist step.
    ///
    /// `None` waits indefinitely. When a persist exceeds the bound the
    /// commit fails with [`CommitError::TimedOut`] and the queue is
    /// aborted: the abandoned write may still land, so the in-memory
    /// aggregate can no longer be trusted to match the log.
    ///
    /// Default: `None`.
    pub commit_timeout: Option<Duration>,

    /// Keep an in-memory copy of the log in front of the backend.
    ///
    /// Default: `false`.
    pub cached: bool,
}

impl Default for TransactorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            publish_capacity: 256,
            commit_timeout: None,
            cached: false,
        }
    }
}

/// A queued request whose result has not been awaited yet.
///
/// Returned by [`Transactor::submit`] and [`Transactor::submit_with`]. The
/// request runs whether or not this is awaited; dropping it only discards
/// the result.
#[derive(Debug)]
#[must_use = "the commit runs regardless, but its result is lost unless awaited"]
pub struct PendingCommit<P> {
    reply: oneshot::Receiver<Result<P, CommitError>>,
}

impl<P> PendingCommit<P> {
    /// Wait for the queued request to finish.
    ///
    /// # Returns
    ///
    /// The aggregate published by this request.
    ///
    /// # Errors
    ///
    /// Any [`CommitError`]; [`CommitError::TransactorGone`] if the worker
    /// exited without answering.
    pub async fn wait(self) -> Result<P, CommitError> {
        self.reply.await.map_err(|_| CommitError::TransactorGone)?
    }
}

/// Async handle to a running transactor.
///
/// Cheap to clone and `Send + Sync`. Every clone talks to the same commit
/// queue, so commits, rollbacks, and imports from all clones are applied one
/// at a time in the order they were queued. The queue worker exits once the
/// last clone is dropped.
///
/// # Type Parameters
///
/// * `D` - The transaction data folded into the aggregate.
/// * `P` - The aggregate ("post") type.
pub struct Transactor<D: Storable, P> {
    sender: mpsc::Sender<Request<D, P>>,
    log: Arc<LogStore<Transaction<D>>>,
    publisher: Arc<Publisher<P>>,
}

// Manual `Clone`: only the channel and the shared `Arc`s are cloned.
impl<D: Storable, P> Clone for Transactor<D, P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            log: Arc::clone(&self.log),
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<D: Storable, P> std::fmt::Debug for Transactor<D, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("key", &self.log.key())
            .field("namespace", &self.log.namespace())
            .field("alive", &!self.sender.is_closed())
            .finish()
    }
}

impl<A: Aggregate> Transactor<A::Transaction, A> {
    /// Start building a transactor whose reducer is [`Aggregate::apply`].
    ///
    /// # Examples
    ///
    /// ```
    /// use foldlog::{Aggregate, Transactor};
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Debug, Clone, Default)]
    /// struct Balance(i64);
    ///
    /// #[derive(Debug, Clone, Serialize, Deserialize)]
    /// enum Movement {
    ///     Deposit(i64),
    ///     Withdraw(i64),
    /// }
    ///
    /// impl Aggregate for Balance {
    ///     type Transaction = Movement;
    ///
    ///     fn apply(self, movement: &Movement) -> Self {
    ///         match movement {
    ///             Movement::Deposit(n) => Balance(self.0 + n),
    ///             Movement::Withdraw(n) => Balance(self.0 - n),
    ///         }
    ///     }
    /// }
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let account = Transactor::for_aggregate(Balance::default())
    ///     .key("checking")
    ///     .open()
    ///     .await?;
    /// account.commit(Movement::Deposit(100)).await?;
    /// let balance = account.commit(Movement::Withdraw(30)).await?;
    /// assert_eq!(balance.0, 70);
    /// # Ok(())
    /// # }
    /// ```
    pub fn for_aggregate(base: A) -> TransactorBuilder<A::Transaction, A> {
        TransactorBuilder::new(base, reducer::<A>())
    }
}

impl<D: Storable, P: Clone + Send + Sync + 'static> Transactor<D, P> {
    /// Start building a transactor that folds with `reduce` over `base`.
    ///
    /// # Arguments
    ///
    /// * `base` - The aggregate before any transaction is applied.
    /// * `reduce` - Pure function folding one transaction into the
    ///   aggregate.
    pub fn builder(
        base: P,
        reduce: impl Fn(&D, P) -> P + Send + Sync + 'static,
    ) -> TransactorBuilder<D, P> {
        TransactorBuilder::new(base, Arc::new(reduce))
    }

    /// Queue a request and hand back the receiving end of its reply.
    async fn enqueue(
        &self,
        request: impl FnOnce(Reply<P>) -> Request<D, P>,
    ) -> Result<PendingCommit<P>, CommitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(request(tx))
            .await
            .map_err(|_| CommitError::TransactorGone)?;
        Ok(PendingCommit { reply: rx })
    }

    /// Queue `data` for commit without waiting for it to be applied.
    ///
    /// Once this returns, the commit's place in the queue is fixed:
    /// requests submitted later from any clone are applied after it.
    ///
    /// # Errors
    ///
    /// [`CommitError::TransactorGone`] if the queue worker has exited.
    pub async fn submit(&self, data: D) -> Result<PendingCommit<P>, CommitError> {
        self.enqueue(|reply| Request::Commit {
            source: Source::Data(data),
            reply,
        })
        .await
    }

    /// Queue a generated commit without waiting for it to be applied.
    ///
    /// `generate` runs inside the queue and receives the aggregate as of
    /// every earlier request, so read-modify-write updates never race.
    ///
    /// # Errors
    ///
    /// [`CommitError::TransactorGone`] if the queue worker has exited.
    pub async fn submit_with(
        &self,
        generate: impl FnOnce(&P) -> D + Send + 'static,
    ) -> Result<PendingCommit<P>, CommitError> {
        self.enqueue(|reply| Request::Commit {
            source: Source::Generate(Box::new(generate)),
            reply,
        })
        .await
    }

    /// Persist `data` as a new transaction and fold it into the aggregate.
    ///
    /// The record is durable in the log before the new aggregate is
    /// published.
    ///
    /// # Arguments
    ///
    /// * `data` - The change to record.
    ///
    /// # Returns
    ///
    /// The aggregate published by this commit.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Storage`] -- the persist failed; the log and the
    ///   aggregate are unchanged and the queue keeps running.
    /// * [`CommitError::TimedOut`] -- the persist exceeded
    ///   [`TransactorConfig::commit_timeout`]; the queue is aborted.
    /// * [`CommitError::Aborted`] -- the queue was aborted while this
    ///   commit waited.
    /// * [`CommitError::TransactorGone`] -- the queue worker has exited.
    pub async fn commit(&self, data: D) -> Result<P, CommitError> {
        self.submit(data).await?.wait().await
    }

    /// Compute a transaction from the latest aggregate, then commit it.
    ///
    /// # Errors
    ///
    /// Same as [`commit`](Transactor::commit).
    pub async fn commit_with(
        &self,
        generate: impl FnOnce(&P) -> D + Send + 'static,
    ) -> Result<P, CommitError> {
        self.submit_with(generate).await?.wait().await
    }

    /// The `count` most recent transactions, newest first, or all of them
    /// when `count` is `None`.
    ///
    /// Reads the log directly, outside the commit queue.
    ///
    /// # Errors
    ///
    /// Returns the log store's error if the log cannot be read.
    pub async fn view_transactions(
        &self,
        count: Option<usize>,
    ) -> Result<Vec<Transaction<D>>, StorageError> {
        self.log.load_last(count).await
    }

    /// Transactions stamped at or after `since`, newest first.
    ///
    /// # Errors
    ///
    /// Returns the log store's error if the log cannot be read.
    pub async fn view_transactions_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction<D>>, StorageError> {
        self.log.load_since(since).await
    }

    /// Discard every transaction newer than `transaction`, keeping it, and
    /// rebuild the aggregate.
    ///
    /// # Errors
    ///
    /// Same as [`rollback_to_after_id`](Transactor::rollback_to_after_id).
    pub async fn rollback_to_after(&self, transaction: &Transaction<D>) -> Result<P, CommitError> {
        self.rollback_to_after_id(transaction.id).await
    }

    /// Discard `transaction` and every transaction newer than it, and
    /// rebuild the aggregate.
    ///
    /// # Errors
    ///
    /// Same as [`rollback_to_before_id`](Transactor::rollback_to_before_id).
    pub async fn rollback_to_before(&self, transaction: &Transaction<D>) -> Result<P, CommitError> {
        self.rollback_to_before_id(transaction.id).await
    }

    /// Discard every transaction newer than `id` and rebuild.
    ///
    /// Runs in the commit queue. An unknown `id` leaves the log as it is
    /// and still rebuilds.
    ///
    /// # Returns
    ///
    /// The rebuilt aggregate, which is also published.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Storage`] -- truncating or replaying the log failed.
    ///   A replay failure after the log was truncated aborts the queue.
    /// * [`CommitError::Aborted`] / [`CommitError::TransactorGone`] -- as for
    ///   [`commit`](Transactor::commit).
    pub async fn rollback_to_after_id(&self, id: Uuid) -> Result<P, CommitError> {
        self.enqueue(|reply| Request::RollbackAfter { id, reply })
            .await?
            .wait()
            .await
    }

    /// Discard `id` and every transaction newer than it, and rebuild.
    ///
    /// # Errors
    ///
    /// Same as [`rollback_to_after_id`](Transactor::rollback_to_after_id).
    pub async fn rollback_to_before_id(&self, id: Uuid) -> Result<P, CommitError> {
        self.enqueue(|reply| Request::RollbackBefore { id, reply })
            .await?
            .wait()
            .await
    }

    /// Logical and allocated bytes used by the log.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn size_and_allocated_size(&self) -> Result<(Bytes, Bytes), StorageError> {
        self.log.size_and_allocated_size().await
    }

    /// Write the log as a JSON file into `dir`.
    ///
    /// # Returns
    ///
    /// Path of the exported file.
    ///
    /// # Errors
    ///
    /// * [`StorageError::AttemptToExportToFile`] -- `dir` is an existing file.
    /// * [`StorageError::NoDataToExport`] -- the log is empty.
    /// * Any I/O or encoding error.
    pub async fn export_data(&self, dir: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
        self.log.export_data(dir.as_ref()).await
    }

    /// Replace the log with the contents of `file` and rebuild.
    ///
    /// Runs in the commit queue, after every request queued before it.
    ///
    /// # Returns
    ///
    /// The rebuilt aggregate, which is also published.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Storage`] wrapping
    ///   [`StorageError::AttemptToImportFromDir`],
    ///   [`StorageError::NoDataToImport`], or a read/decode error; the log
    ///   and aggregate are unchanged.
    /// * [`CommitError::Aborted`] / [`CommitError::TransactorGone`] -- as for
    ///   [`commit`](Transactor::commit).
    pub async fn import_data(&self, file: impl AsRef<Path>) -> Result<P, CommitError> {
        let file = file.as_ref().to_path_buf();
        self.enqueue(|reply| Request::Import { file, reply })
            .await?
            .wait()
            .await
    }

    /// Subscribe to published aggregates, starting with the current one.
    pub fn subscribe(&self) -> Subscription<P> {
        self.publisher.subscribe()
    }

    /// Clone of the most recently published aggregate.
    pub fn current(&self) -> P {
        self.publisher.current()
    }

    /// The key the log is stored under.
    pub fn key(&self) -> &str {
        self.log.key()
    }

    /// Check whether the commit queue is still running.
    ///
    /// Returns `false` once the queue has been aborted or its worker has
    /// panicked.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Builder for a [`Transactor`].
///
/// Defaults: key `"transactions-generic"`, no namespace, a private
/// volatile [`MemoryTable`], no flatten function, and
/// [`TransactorConfig::default`]. Call [`location`](Self::location) to keep
/// the log somewhere that outlives the transactor.
///
/// # Examples
///
/// ```no_run
/// use foldlog::{StorageLocation, Transactor};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let notes = Transactor::builder(String::new(), |line: &String, text: String| text + line)
///     .key("notes")
///     .namespace("journal")
///     .location(StorageLocation::durable("/var/lib/journal"))
///     .cached(true)
///     .open()
///     .await?;
/// notes.commit("first entry\n".to_owned()).await?;
/// # Ok(())
/// # }
/// ```
pub struct TransactorBuilder<D: Storable, P> {
    base: P,
    reduce: ReduceFn<D, P>,
    flatten: Option<FlattenFn<D>>,
    key: String,
    namespace: Option<String>,
    location: StorageLocation,
    backend: Option<Arc<dyn StorageBackend<Vec<Transaction<D>>>>>,
    config: TransactorConfig,
}

impl<D: Storable, P: Clone + Send + Sync + 'static> TransactorBuilder<D, P> {
    fn new(base: P, reduce: ReduceFn<D, P>) -> Self {
        Self {
            base,
            reduce,
            flatten: None,
            key: DEFAULT_KEY.to_owned(),
            namespace: None,
            location: StorageLocation::Volatile(MemoryTable::new()),
            backend: None,
            config: TransactorConfig::default(),
        }
    }

    /// Store the log under `key`.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Store the log under a versioned key, including its namespace.
    pub fn storage_key(mut self, key: &StorageKey) -> Self {
        self.key = key.physical_key();
        self.namespace = key.namespace().map(str::to_owned);
        self
    }

    /// Place the log in `namespace`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Where the log is kept.
    pub fn location(mut self, location: StorageLocation) -> Self {
        self.location = location;
        self
    }

    /// Use a custom backend instead of one built from the location.
    ///
    /// The backend is expected to be scoped to the namespace already; the
    /// namespace is then only used to place exported files.
    pub fn backend(mut self, backend: Arc<dyn StorageBackend<Vec<Transaction<D>>>>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Compact the history into one transaction when rebuilding.
    ///
    /// `flatten` receives the history oldest first; applying its result to
    /// the base must give the same aggregate as applying every transaction
    /// in turn.
    pub fn flatten(mut self, flatten: impl Fn(&[D]) -> D + Send + Sync + 'static) -> Self {
        self.flatten = Some(Arc::new(flatten));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransactorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set [`TransactorConfig::commit_timeout`].
    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.config.commit_timeout = Some(timeout);
        self
    }

    /// Set [`TransactorConfig::cached`].
    pub fn cached(mut self, cached: bool) -> Self {
        self.config.cached = cached;
        self
    }

    /// Open the log, rebuild the aggregate from it, and start the commit
    /// queue.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`StorageError::Io`] -- the durable namespace directory cannot be
    ///   created or the log cannot be read.
    /// * [`StorageError::Json`] -- the stored log cannot be decoded.
    pub async fn open(self) -> Result<Transactor<D, P>, StorageError> {
        let Self {
            base,
            reduce,
            flatten,
            key,
            namespace,
            location,
            backend,
            config,
        } = self;

        let log = match backend {
            Some(backend) => LogStore::with_store(ValueStore::with_backend(
                key,
                namespace,
                config.cached,
                backend,
            )),
            None => LogStore::new(key, namespace.as_deref(), config.cached, &location)?,
        };
        let log = Arc::new(log);

        let fold = Fold::new(reduce, flatten);
        let current = queue::replay(&log, &fold, &base).await?;
        let publisher = Arc::new(Publisher::new(current.clone(), config.publish_capacity));

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Worker {
            base,
            current,
            log: Arc::clone(&log),
            fold,
            publisher: Arc::clone(&publisher),
            commit_timeout: config.commit_timeout,
        };
        tokio::spawn(queue::run_queue(worker, rx));

        tracing::info!(
            key = log.key(),
            namespace = log.namespace(),
            "transactor opened"
        );

        Ok(Transactor {
            sender: tx,
            log,
            publisher,
        })
    }
}
