//! In-memory fakes for the pipeline's external collaborators
//!
//! The library's own mocks are test-private, so integration tests carry
//! their own. These add controls the unit mocks do not need: scripted
//! outages and an in-flight gauge for concurrency assertions.

use async_trait::async_trait;
use pixq_ingest::services::reference_client::{RefMatch, ReferenceError, ReferenceLookup};
use pixq_ingest::services::storage_client::{ObjectStore, StorageError, StoredObject};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

struct StoredRecord {
    object_id: String,
    object_name: String,
    bytes: Vec<u8>,
}

/// Object store fake with scripted failures and a concurrency gauge
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Vec<StoredRecord>>,
    next_id: AtomicUsize,
    /// Remaining put calls to refuse before succeeding
    fail_remaining: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    put_delay: Duration,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the first `n` put calls with a 503
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_remaining: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Hold each put open for `delay` so overlapping calls register on
    /// the in-flight gauge
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn stored_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn contains_name(&self, object_name: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.object_name == object_name)
    }

    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.object_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Highest number of puts observed in flight at once
    pub fn max_concurrent_puts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }

        let result = if self.take_failure() {
            Err(StorageError::Rejected {
                status: 503,
                message: "scripted outage".to_string(),
            })
        } else {
            let object_id = format!("obj-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let size = bytes.len() as i64;
            self.objects.lock().unwrap().push(StoredRecord {
                object_id: object_id.clone(),
                object_name: object_name.to_string(),
                bytes,
            });
            Ok(StoredObject {
                object_id,
                object_name: object_name.to_string(),
                size,
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn download(&self, object_id: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.object_id == object_id)
            .map(|r| r.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(object_id.to_string()))
    }

    async fn exists(&self, object_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.object_id == object_id))
    }
}

/// Reference service fake with a toggleable outage
#[derive(Default)]
pub struct FakeReference {
    entries: HashMap<String, RefMatch>,
    failing: AtomicBool,
}

impl FakeReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: &str, title: &str) -> Self {
        self.entries.insert(
            key.to_string(),
            RefMatch {
                key: key.to_string(),
                title: Some(title.to_string()),
                description: None,
            },
        );
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReferenceLookup for FakeReference {
    async fn lookup(&self, key: &str) -> Result<Option<RefMatch>, ReferenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReferenceError::Upstream {
                status: 502,
                message: "scripted outage".to_string(),
            });
        }
        Ok(self.entries.get(key).cloned())
    }
}
