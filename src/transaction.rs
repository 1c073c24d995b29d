//! Transaction records and the record contract the log store relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// A record that can live in a [`LogStore`](crate::LogStore).
///
/// # Contract
///
/// - [`id`](Loggable::id) is unique within one log.
/// - [`timestamp`](Loggable::timestamp) is fixed at creation. Range queries
///   assume the log is ordered newest first by timestamp, which holds as
///   long as records are appended with non-decreasing timestamps.
pub trait Loggable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Unique identifier of this record.
    fn id(&self) -> Uuid;

    /// When this record was created.
    fn timestamp(&self) -> DateTime<Utc>;
}

/// An immutable, timestamped, uniquely identified unit of change.
///
/// `data` is whatever the transactor's reducer folds into the aggregate.
///
/// # Examples
///
/// ```
/// use foldlog::{Loggable, Transaction};
///
/// let first = Transaction::new("hello".to_owned());
/// let second = Transaction::new(" world".to_owned());
/// assert_ne!(first.id(), second.id());
/// assert!(second.timestamp() >= first.timestamp());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction<D> {
    /// Random v4 identifier.
    pub id: Uuid,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// The change itself.
    pub data: D,
}

impl<D> Transaction<D> {
    /// Wrap `data` with a fresh id and the current time.
    pub fn new(data: D) -> Self {
        Self::at(data, Utc::now())
    }

    /// Wrap `data` with a fresh id and an explicit timestamp.
    pub fn at(data: D, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            data,
        }
    }
}

impl<D> Loggable for Transaction<D>
where
    D: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn id(&self) -> Uuid {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
