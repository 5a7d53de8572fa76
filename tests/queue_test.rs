use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stac_ingestor::catalog::CatalogStore;
use stac_ingestor::db::{self, NewSubmission, Pool};
use stac_ingestor::model::Status;
use stac_ingestor::queue::{BatchPolicy, BatchQueue, TickReport};
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct RecordingCatalog {
    failing: Arc<Mutex<HashSet<String>>>,
    slow: Arc<Mutex<HashSet<String>>>,
    writes: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl RecordingCatalog {
    async fn fail_collection(&self, collection: &str) {
        self.failing.lock().await.insert(collection.to_string());
    }

    async fn slow_collection(&self, collection: &str) {
        self.slow.lock().await.insert(collection.to_string());
    }

    async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    async fn writes(&self) -> Vec<(String, Vec<String>)> {
        self.writes.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl CatalogStore for RecordingCatalog {
    async fn collection_exists(&self, _collection_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn get_collection(&self, _collection_id: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn upsert_collection(&self, _collection: &Value) -> Result<()> {
        Ok(())
    }

    async fn delete_collection(&self, _collection_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn insert_items(&self, collection_id: &str, items: &[Value]) -> Result<u64> {
        let slow = self.slow.lock().await.contains(collection_id);
        if slow {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        if self.failing.lock().await.contains(collection_id) {
            return Err(anyhow!("catalog unavailable for {collection_id}"));
        }
        let ids = items
            .iter()
            .map(|i| i["id"].as_str().unwrap_or_default().to_string())
            .collect();
        self.writes.lock().await.push((collection_id.to_string(), ids));
        Ok(items.len() as u64)
    }

    async fn count_items(&self, _collection_id: &str) -> Result<i64> {
        Ok(0)
    }
}

fn policy(max_items: usize, max_wait_ms: i64, max_attempts: i32) -> BatchPolicy {
    BatchPolicy {
        max_items,
        max_wait: ChronoDuration::milliseconds(max_wait_ms),
        poll_interval: Duration::from_millis(10),
        max_attempts,
        max_backoff_secs: 60,
    }
}

/// Record `id` and walk it to `queued` at `at`.
async fn enqueue(pool: &Pool, id: &str, collection: &str, at: DateTime<Utc>) {
    let payload = json!({ "id": id, "collection": collection });
    db::insert_submission(
        pool,
        &NewSubmission {
            id,
            item_id: Some(id),
            collection_id: Some(collection),
            payload: &payload,
            created_by: "tester",
        },
        at,
    )
    .await
    .unwrap();
    db::transition_submission(pool, id, Status::Received, Status::Validating, None, at)
        .await
        .unwrap();
    db::transition_submission(pool, id, Status::Validating, Status::Queued, None, at)
        .await
        .unwrap();
}

async fn status_of(pool: &Pool, id: &str) -> Status {
    db::fetch_submission(pool, id).await.unwrap().unwrap().status
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn size_threshold_seals_full_batches_only() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(2, 60_000, 3));
    let t0 = Utc::now();
    for id in ["a", "b", "c"] {
        enqueue(&pool, id, "c1", t0).await;
    }

    let report = queue.tick(t0).await.unwrap();
    assert_eq!(report.sealed, 1);
    assert_eq!(report.published, 2);
    assert_eq!(catalog.writes().await, vec![("c1".to_string(), ids(&["a", "b"]))]);
    assert_eq!(status_of(&pool, "a").await, Status::Published);
    assert_eq!(status_of(&pool, "c").await, Status::Queued);
}

#[tokio::test]
async fn time_threshold_flushes_partial_batch() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(100, 500, 3));
    let t0 = Utc::now();
    enqueue(&pool, "x", "c1", t0).await;

    let early = queue.tick(t0 + ChronoDuration::milliseconds(100)).await.unwrap();
    assert!(early.is_idle());
    assert_eq!(status_of(&pool, "x").await, Status::Queued);

    let late = queue.tick(t0 + ChronoDuration::milliseconds(600)).await.unwrap();
    assert_eq!(
        late,
        TickReport {
            sealed: 1,
            published: 1,
            failed: 0,
            retried: 0
        }
    );
    assert_eq!(status_of(&pool, "x").await, Status::Published);
    let history: Vec<Status> = db::fetch_history(&pool, "x")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.status)
        .collect();
    assert_eq!(
        history,
        vec![
            Status::Received,
            Status::Validating,
            Status::Queued,
            Status::Publishing,
            Status::Published
        ]
    );
}

#[tokio::test]
async fn batches_of_a_collection_go_out_in_insertion_order() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(2, 0, 3));
    let t0 = Utc::now();
    for id in ["e1", "e2", "e3", "e4", "e5"] {
        enqueue(&pool, id, "c1", t0).await;
    }

    let first = queue.tick(t0).await.unwrap();
    assert_eq!(first.sealed, 3);
    // Only the head batch of a collection is dispatched per tick.
    assert_eq!(first.published, 2);
    queue.tick(t0).await.unwrap();
    queue.tick(t0).await.unwrap();

    assert_eq!(
        catalog.writes().await,
        vec![
            ("c1".to_string(), ids(&["e1", "e2"])),
            ("c1".to_string(), ids(&["e3", "e4"])),
            ("c1".to_string(), ids(&["e5"])),
        ]
    );
    assert_eq!(db::count_batches(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn failing_collection_does_not_hold_back_others() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    catalog.fail_collection("bad").await;
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(10, 0, 3));
    let t0 = Utc::now();
    enqueue(&pool, "b1", "bad", t0).await;
    enqueue(&pool, "g1", "good", t0).await;

    let report = queue.tick(t0).await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(status_of(&pool, "g1").await, Status::Published);
    assert_eq!(status_of(&pool, "b1").await, Status::Publishing);

    // Backoff is 5s after the first failure.
    catalog.heal().await;
    assert!(queue.tick(t0 + ChronoDuration::seconds(1)).await.unwrap().is_idle());
    let retried = queue.tick(t0 + ChronoDuration::seconds(6)).await.unwrap();
    assert_eq!(retried.published, 1);
    assert_eq!(status_of(&pool, "b1").await, Status::Published);
}

#[tokio::test]
async fn exhausted_retries_fail_every_member() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    catalog.fail_collection("c1").await;
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(10, 0, 2));
    let t0 = Utc::now();
    enqueue(&pool, "a", "c1", t0).await;
    enqueue(&pool, "b", "c1", t0).await;

    assert_eq!(queue.tick(t0).await.unwrap().retried, 1);
    let last = queue.tick(t0 + ChronoDuration::seconds(6)).await.unwrap();
    assert_eq!(last.failed, 2);

    for id in ["a", "b"] {
        let sub = db::fetch_submission(&pool, id).await.unwrap().unwrap();
        assert_eq!(sub.status, Status::PublishFailed);
        assert!(sub.message.unwrap().contains("catalog unavailable"));
    }
    assert_eq!(db::count_batches(&pool).await.unwrap(), 0);
    assert!(catalog.writes().await.is_empty());
}

#[tokio::test]
async fn batch_left_in_flight_is_redelivered_after_recover() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(10, 0, 3));
    let t0 = Utc::now();
    enqueue(&pool, "a", "c1", t0).await;

    // A worker claimed the batch and died before settling it.
    let batch_id = db::seal_batch(&pool, "c1", 10, t0).await.unwrap().unwrap();
    assert!(db::claim_batch(&pool, batch_id).await.unwrap());
    assert!(queue.tick(t0).await.unwrap().is_idle());

    assert_eq!(queue.recover().await.unwrap(), 1);
    let report = queue.tick(t0).await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(catalog.writes().await, vec![("c1".to_string(), ids(&["a"]))]);
}

#[tokio::test]
async fn cancelled_submissions_are_not_published() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(10, 0, 3));
    let t0 = Utc::now();
    enqueue(&pool, "keep", "c1", t0).await;
    enqueue(&pool, "drop", "c1", t0).await;
    db::transition_submission(&pool, "drop", Status::Queued, Status::Cancelled, None, t0)
        .await
        .unwrap();

    queue.tick(t0).await.unwrap();
    assert_eq!(catalog.writes().await, vec![("c1".to_string(), ids(&["keep"]))]);
    assert_eq!(status_of(&pool, "drop").await, Status::Cancelled);
}

#[tokio::test]
async fn drain_ignores_the_time_threshold() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(2, 3_600_000, 3));
    let now = Utc::now();
    for id in ["a", "b", "c"] {
        enqueue(&pool, id, "c1", now).await;
    }

    let total = queue.drain().await.unwrap();
    assert_eq!(total.published, 3);
    assert_eq!(db::count_by_status(&pool, Status::Queued).await.unwrap(), 0);
}

#[tokio::test]
async fn slow_collection_does_not_block_others_in_worker() {
    let pool = db::memory_pool().await.unwrap();
    let catalog = RecordingCatalog::default();
    catalog.slow_collection("slow").await;
    let queue = BatchQueue::new(pool.clone(), Arc::new(catalog.clone()), policy(10, 0, 3));
    let handle = queue.handle();
    let worker = tokio::spawn(queue.run());

    enqueue(&pool, "s1", "slow", Utc::now()).await;
    handle.notify();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(status_of(&pool, "s1").await, Status::Publishing);

    enqueue(&pool, "f1", "fast", Utc::now()).await;
    handle.notify();
    let mut published = false;
    for _ in 0..50 {
        if status_of(&pool, "f1").await == Status::Published {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(published, "fast collection waited on the slow write");
    assert_eq!(status_of(&pool, "s1").await, Status::Publishing);
    assert_eq!(catalog.writes().await, vec![("fast".to_string(), ids(&["f1"]))]);

    worker.abort();
}
