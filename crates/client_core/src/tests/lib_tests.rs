use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use storage::{SnapshotStream, Storage};

const WAIT: Duration = Duration::from_secs(5);

/// Wraps a real store and counts the snapshot streams it hands out.
struct CountingStore {
    inner: Storage,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    fail_writes: bool,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CountingStore {
    async fn new() -> Self {
        Self {
            inner: Storage::new("sqlite::memory:").await.expect("db"),
            opened: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            fail_writes: false,
        }
    }

    fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

#[async_trait]
impl ItemStore for CountingStore {
    async fn insert(&self, item: NewItem) -> Result<ItemId, StoreError> {
        if self.fail_writes {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.insert(item).await
    }

    async fn delete(&self, item: &Item) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.delete(item).await
    }

    async fn observe_all(&self) -> Result<SnapshotStream, StoreError> {
        let snapshots = self.inner.observe_all().await?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        Ok(snapshots
            .map(move |snapshot| {
                let _held = &guard;
                snapshot
            })
            .boxed())
    }
}

async fn controller_with(grace: Duration) -> (ListController, Arc<CountingStore>) {
    let store = Arc::new(CountingStore::new().await);
    let controller = ListController::with_config(
        store.clone(),
        ControllerConfig { share_grace: grace },
    );
    (controller, store)
}

async fn wait_for_len(subscription: &mut ListSubscription, len: usize) -> Snapshot {
    tokio::time::timeout(WAIT, subscription.wait_for(|items| items.len() == len))
        .await
        .expect("list reaches expected length in time")
        .expect("controller alive")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn added_item_shows_up_with_its_fields() {
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let mut list = controller.current_list();
    wait_until(|| controller.is_upstream_active()).await;

    let id = controller
        .add_item("Milk", "2", "L", "3.50")
        .expect("valid")
        .wait()
        .await
        .expect("insert");

    let snapshot = wait_for_len(&mut list, 1).await;
    assert_eq!(
        snapshot[0],
        Item {
            id,
            name: "Milk".into(),
            quantity: "2".into(),
            unit: "L".into(),
            price: "3.50".into(),
        }
    );
}

#[tokio::test]
async fn list_is_newest_first() {
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let mut list = controller.current_list();

    for name in ["A", "B", "C"] {
        controller
            .add_item(name, "1", "", "1")
            .expect("valid")
            .wait()
            .await
            .expect("insert");
    }

    let snapshot = wait_for_len(&mut list, 3).await;
    let names: Vec<_> = snapshot.iter().map(|item| item.name.as_str()).collect();
    assert_eq!(names, vec!["C", "B", "A"]);
}

#[tokio::test]
async fn delete_removes_exactly_one_item() {
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let mut list = controller.current_list();
    for name in ["Bread", "Eggs", "Rice"] {
        controller
            .add_item(name, "1", "", "1")
            .expect("valid")
            .wait()
            .await
            .expect("insert");
    }
    let before = wait_for_len(&mut list, 3).await;
    let eggs = before[1].clone();

    controller
        .delete_item(eggs.clone())
        .wait()
        .await
        .expect("delete");

    let after = wait_for_len(&mut list, 2).await;
    let expected: Vec<Item> = before.iter().filter(|item| item.id != eggs.id).cloned().collect();
    assert_eq!(*after, expected);
}

#[tokio::test]
async fn blank_name_is_rejected_before_the_store() {
    let (controller, store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let before = store.inner.list_items().await.expect("list").len();

    let err = controller
        .add_item("", "1", "kg", "2.00")
        .err()
        .expect("blank name rejected");
    assert_eq!(err.code(), ErrorCode::Validation);
    assert!(controller.add_item("  ", "1", "kg", "2.00").is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.inner.list_items().await.expect("list").len(), before);
}

#[tokio::test]
async fn concurrent_adds_all_land_with_distinct_ids() {
    const ADDS: usize = 12;
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let mut list = controller.current_list();

    let pending: Vec<_> = (0..ADDS)
        .map(|n| {
            controller
                .add_item(&format!("item-{n}"), "1", "", "1")
                .expect("valid")
        })
        .collect();
    for mutation in pending {
        mutation.wait().await.expect("insert");
    }

    let snapshot = wait_for_len(&mut list, ADDS).await;
    let mut ids: Vec<_> = snapshot.iter().map(|item| item.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), ADDS);
}

#[tokio::test]
async fn two_consumers_observe_the_same_snapshot() {
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    controller
        .add_item("Cheese", "200", "g", "3.10")
        .expect("valid")
        .wait()
        .await
        .expect("insert");

    let mut first = controller.current_list();
    let first_view = wait_for_len(&mut first, 1).await;
    let mut second = first.clone();
    let second_view = wait_for_len(&mut second, 1).await;
    assert_eq!(first_view, second_view);
}

#[tokio::test]
async fn dropped_mutation_handle_still_completes() {
    let (controller, _store) = controller_with(DEFAULT_SHARE_GRACE).await;
    let mut list = controller.current_list();

    drop(controller.add_item("Tea", "1", "box", "3").expect("valid"));

    let snapshot = wait_for_len(&mut list, 1).await;
    assert_eq!(snapshot[0].name, "Tea");
}

#[tokio::test]
async fn failed_write_leaves_list_unchanged() {
    let store = Arc::new(CountingStore::new().await.failing_writes());
    store
        .inner
        .insert_item(&NewItem::new("Salt", "1", "", "0.50"))
        .await
        .expect("seed");
    let controller = ListController::new(store.clone());
    let mut list = controller.current_list();
    let before = wait_for_len(&mut list, 1).await;

    let err = controller
        .add_item("Pepper", "1", "", "0.90")
        .expect("valid")
        .wait()
        .await
        .expect_err("write fails");
    assert_eq!(err.code(), ErrorCode::Storage);

    let err = controller
        .delete_item(before[0].clone())
        .wait()
        .await
        .expect_err("delete fails");
    assert!(matches!(err, ControllerError::Store(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(list.latest(), before);
}

#[tokio::test]
async fn upstream_outlives_last_consumer_for_the_grace_window() {
    let (controller, store) = controller_with(Duration::from_millis(300)).await;
    assert!(!controller.is_upstream_active());

    let list = controller.current_list();
    wait_until(|| store.live.load(Ordering::SeqCst) == 1).await;
    drop(list);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_upstream_active());
    assert_eq!(store.live.load(Ordering::SeqCst), 1);

    wait_until(|| store.live.load(Ordering::SeqCst) == 0).await;
    assert!(!controller.is_upstream_active());
    assert_eq!(store.opened.load(Ordering::SeqCst), 1);

    let _again = controller.current_list();
    wait_until(|| store.live.load(Ordering::SeqCst) == 1).await;
    assert_eq!(store.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reattach_within_grace_reuses_the_upstream() {
    let (controller, store) = controller_with(Duration::from_millis(500)).await;

    let first = controller.current_list();
    wait_until(|| store.live.load(Ordering::SeqCst) == 1).await;
    drop(first);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = controller.current_list();
    // Outlast the first grace window; the interrupted drain must not fire.
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(controller.is_upstream_active());
    assert_eq!(store.opened.load(Ordering::SeqCst), 1);
    assert_eq!(store.live.load(Ordering::SeqCst), 1);
    drop(second);
}

#[tokio::test]
async fn zero_grace_cancels_immediately() {
    let (controller, store) = controller_with(Duration::ZERO).await;

    let list = controller.current_list();
    wait_until(|| store.live.load(Ordering::SeqCst) == 1).await;
    drop(list);

    assert!(!controller.is_upstream_active());
    wait_until(|| store.live.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn cached_list_survives_detach() {
    let (controller, store) = controller_with(Duration::from_millis(50)).await;
    assert!(controller.snapshot().is_empty());

    let mut list = controller.current_list();
    controller
        .add_item("Oats", "1", "kg", "2.50")
        .expect("valid")
        .wait()
        .await
        .expect("insert");
    wait_for_len(&mut list, 1).await;
    drop(list);
    wait_until(|| store.live.load(Ordering::SeqCst) == 0).await;

    assert_eq!(controller.snapshot().len(), 1);
    let reattached = controller.current_list();
    assert_eq!(reattached.latest()[0].name, "Oats");
}
