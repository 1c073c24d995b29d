//! Transactional event log with a folded aggregate.
//!
//! A [`Transactor`] keeps an append-only [`LogStore`] of [`Transaction`]s and
//! the aggregate obtained by folding them over a base value. Commits go
//! through a single queue, are durable before they are published, and can be
//! rolled back to any point in the log. Storage is either JSON files on disk
//! or a shared in-process [`MemoryTable`], chosen by [`StorageLocation`].
//!
//! ```
//! use foldlog::Transactor;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let greeting = Transactor::builder(String::new(), |word: &String, text: String| text + word)
//!     .key("greeting")
//!     .open()
//!     .await?;
//!
//! greeting.commit("hello".to_owned()).await?;
//! let text = greeting.commit(" world".to_owned()).await?;
//! assert_eq!(text, "hello world");
//!
//! let first = greeting.view_transactions(None).await?.pop().ok_or("log is empty")?;
//! assert_eq!(greeting.rollback_to_after(&first).await?, "hello");
//! # Ok(())
//! # }
//! ```

mod backend;
mod error;
mod file;
mod fold;
mod key;
mod log_store;
mod memory;
mod publish;
mod queue;
mod transaction;
mod transactor;
mod value_store;

pub use backend::{Bytes, Storable, StorageBackend, StorageLocation};
pub use error::{CommitError, StorageError};
pub use file::{JsonFileBackend, sanitize};
pub use fold::{Aggregate, FlattenFn, ReduceFn, reducer};
pub use key::StorageKey;
pub use log_store::LogStore;
pub use memory::{MemoryBackend, MemoryTable};
pub use publish::Subscription;
pub use transaction::{Loggable, Transaction};
pub use transactor::{PendingCommit, Transactor, TransactorBuilder, TransactorConfig};
pub use value_store::ValueStore;
