//! End-to-end tests through the public API only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use foldlog::{
    Aggregate, Bytes, CommitError, LogStore, MemoryBackend, MemoryTable, StorageBackend,
    StorageError, StorageKey, StorageLocation, Transaction, Transactor, TransactorConfig,
    ValueStore,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Default, PartialEq)]
struct Inventory {
    items: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Stock {
    Received { sku: String, qty: u32 },
    Shipped { sku: String, qty: u32 },
}

impl Aggregate for Inventory {
    type Transaction = Stock;

    fn apply(mut self, change: &Stock) -> Self {
        match change {
            Stock::Received { sku, qty } => {
                *self.items.entry(sku.clone()).or_default() += qty;
            }
            Stock::Shipped { sku, qty } => {
                let on_hand = self.items.entry(sku.clone()).or_default();
                *on_hand = on_hand.saturating_sub(*qty);
            }
        }
        self
    }
}

fn received(sku: &str, qty: u32) -> Stock {
    Stock::Received {
        sku: sku.to_owned(),
        qty,
    }
}

fn shipped(sku: &str, qty: u32) -> Stock {
    Stock::Shipped {
        sku: sku.to_owned(),
        qty,
    }
}

/// Memory-backed store that can be switched to refuse writes.
struct ReadOnlySwitch {
    inner: MemoryBackend<Vec<Transaction<Stock>>>,
    read_only: Arc<AtomicBool>,
}

#[async_trait]
impl StorageBackend<Vec<Transaction<Stock>>> for ReadOnlySwitch {
    async fn save(&self, key: &str, value: &Vec<Transaction<Stock>>) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )
            .into());
        }
        self.inner.save(key, value).await
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<Transaction<Stock>>>, StorageError> {
        self.inner.load(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn size(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner.size(key).await
    }

    async fn allocated_size(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner.allocated_size(key).await
    }
}

#[tokio::test]
async fn durable_inventory_survives_restart() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let key = StorageKey::new("warehouse", 1).with_namespace("inventory");

    {
        let store = Transactor::for_aggregate(Inventory::default())
            .storage_key(&key)
            .location(StorageLocation::durable(tmp.path()))
            .cached(true)
            .open()
            .await
            .expect("open");
        store.commit(received("bolt", 100)).await.expect("commit");
        store.commit(shipped("bolt", 30)).await.expect("commit");
        store.commit(received("nut", 10)).await.expect("commit");
    }

    let store = Transactor::for_aggregate(Inventory::default())
        .storage_key(&key)
        .location(StorageLocation::durable(tmp.path()))
        .open()
        .await
        .expect("reopen");
    let current = store.current();
    assert_eq!(current.items.get("bolt"), Some(&70));
    assert_eq!(current.items.get("nut"), Some(&10));
    assert_eq!(store.view_transactions(None).await.expect("view").len(), 3);
}

#[tokio::test]
async fn clones_share_one_ordered_queue() {
    let store = Transactor::for_aggregate(Inventory::default())
        .open()
        .await
        .expect("open");

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let handle = store.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                handle
                    .commit_with(move |_current: &Inventory| received(&format!("sku-{worker}"), 1))
                    .await
                    .expect("commit");
            }
        }));
    }
    for task in tasks {
        task.await.expect("task should not panic");
    }

    let current = store.current();
    assert_eq!(current.items.len(), 8);
    assert!(current.items.values().all(|qty| *qty == 5));
    assert_eq!(store.view_transactions(None).await.expect("view").len(), 40);
}

#[tokio::test]
async fn transactors_on_one_table_are_isolated_by_key() {
    let table = MemoryTable::new();
    let location = StorageLocation::volatile(&table);

    let east = Transactor::for_aggregate(Inventory::default())
        .key("east")
        .location(location.clone())
        .open()
        .await
        .expect("open east");
    let west = Transactor::for_aggregate(Inventory::default())
        .key("west")
        .location(location)
        .open()
        .await
        .expect("open west");

    east.commit(received("bolt", 1)).await.expect("commit");
    west.commit(received("nut", 2)).await.expect("commit");

    assert!(east.current().items.get("nut").is_none());
    assert!(west.current().items.get("bolt").is_none());
    assert_eq!(table.len(), 2);

    table.wipe();
    assert!(east.view_transactions(None).await.expect("view").is_empty());
}

#[tokio::test]
async fn custom_backend_failure_is_reported_and_recoverable() {
    let read_only = Arc::new(AtomicBool::new(false));
    let backend = ReadOnlySwitch {
        inner: MemoryBackend::new(&MemoryTable::new(), None),
        read_only: Arc::clone(&read_only),
    };

    let store = Transactor::for_aggregate(Inventory::default())
        .backend(Arc::new(backend))
        .open()
        .await
        .expect("open");
    store.commit(received("bolt", 5)).await.expect("commit");

    read_only.store(true, Ordering::SeqCst);
    let err = store
        .commit(shipped("bolt", 5))
        .await
        .expect_err("write should be refused");
    assert!(matches!(err, CommitError::Storage(StorageError::Io(_))));
    assert_eq!(store.current().items.get("bolt"), Some(&5));

    read_only.store(false, Ordering::SeqCst);
    let after = store.commit(shipped("bolt", 2)).await.expect("commit");
    assert_eq!(after.items.get("bolt"), Some(&3));
}

#[tokio::test]
async fn subscription_stream_follows_commits_and_rollbacks() {
    let store = Transactor::builder(0i64, |delta: &i64, total: i64| total + delta)
        .config(TransactorConfig {
            publish_capacity: 64,
            ..TransactorConfig::default()
        })
        .open()
        .await
        .expect("open");

    let stream = store.subscribe().into_stream();

    store.commit(10).await.expect("commit");
    let second = store.commit(5).await.expect("commit");
    assert_eq!(second, 15);
    store.commit(-3).await.expect("commit");

    let log = store.view_transactions(None).await.expect("view");
    store.rollback_to_after(&log[1]).await.expect("rollback");

    drop(store);
    let seen: Vec<i64> = stream.collect().await;
    assert_eq!(seen, [0, 10, 15, 12, 15]);
}

#[tokio::test]
async fn log_store_and_value_store_work_standalone() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let location = StorageLocation::durable(tmp.path());

    let settings: ValueStore<BTreeMap<String, String>> =
        ValueStore::new("settings", Some("app"), true, &location).expect("value store");
    let mut values = BTreeMap::new();
    values.insert("theme".to_owned(), "dark".to_owned());
    settings.save(&values).await.expect("save");
    assert_eq!(settings.load().await.expect("load"), Some(values));

    let audit: LogStore<Transaction<String>> =
        LogStore::new("audit", Some("app"), false, &location).expect("log store");
    for entry in ["login", "change-theme", "logout"] {
        audit
            .append(Transaction::new(entry.to_owned()))
            .await
            .expect("append");
    }
    let last_two: Vec<String> = audit
        .load_last(Some(2))
        .await
        .expect("load")
        .into_iter()
        .map(|t| t.data)
        .collect();
    assert_eq!(last_two, ["logout", "change-theme"]);

    let exported = audit
        .export_data(&tmp.path().join("backup"))
        .await
        .expect("export");
    audit.delete_last(None).await.expect("clear");
    assert!(audit.load().await.expect("load").is_empty());

    audit.import_data(&exported).await.expect("import");
    assert_eq!(audit.load().await.expect("load").len(), 3);
}
