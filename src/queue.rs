use std::{collections::VecDeque, sync::Arc};

use crate::{
    request::{FailedRequestRecord, QueueEntryStatus, QueuedRequest, RequestId},
    storage::{Storage, FAILED_REQUESTS_KEY, PENDING_REQUESTS_KEY},
    StorageError,
};

/// In-memory FIFO of unconfirmed requests mirrored to [`Storage`].
///
/// Every mutation rewrites the `pendingRequests` key with the mutating
/// entries of the queue, or removes the key when none are left. Storage
/// failures are logged and never propagated.
pub(crate) struct RequestQueue {
    entries: VecDeque<QueuedRequest>,
    storage: Arc<dyn Storage>,
    failed_capacity: usize,
}

impl RequestQueue {
    pub(crate) fn new(storage: Arc<dyn Storage>, failed_capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            storage,
            failed_capacity,
        }
    }

    pub(crate) fn set_failed_capacity(&mut self, failed_capacity: usize) {
        self.failed_capacity = failed_capacity;
    }

    /// Moves persisted requests into memory and clears the durable copy.
    ///
    /// Returns the number of requests added.
    pub(crate) fn load_persisted(&mut self) -> usize {
        let raw = match self.storage.get(PENDING_REQUESTS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read pending requests");
                return 0;
            }
        };

        let requests: Vec<QueuedRequest> = match serde_json::from_str(&raw) {
            Ok(requests) => requests,
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable pending requests");
                return 0;
            }
        };

        let mut added = 0;
        for request in requests {
            if !self.contains(&request.id) {
                self.entries.push_back(request);
                added += 1;
            }
        }

        if let Err(err) = self.storage.remove(PENDING_REQUESTS_KEY) {
            tracing::warn!(error = %err, "failed to clear pending requests after load");
        }
        // Entries queued before loading were mirrored under the same key.
        if self.entries.len() > added {
            self.persist();
        }

        tracing::info!(loaded = added, "loaded pending requests from storage");
        added
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.entries.iter().any(|request| &request.id == id)
    }

    /// Appends `request` unless one with the same id is already queued.
    pub(crate) fn push(&mut self, request: QueuedRequest) -> bool {
        if self.contains(&request.id) {
            return false;
        }
        tracing::info!(
            id = %request.id,
            url = %request.url,
            queue_len = self.entries.len() + 1,
            "added request to queue"
        );
        self.entries.push_back(request);
        self.persist();
        true
    }

    pub(crate) fn remove(&mut self, id: &RequestId) -> Option<QueuedRequest> {
        let index = self.entries.iter().position(|request| &request.id == id)?;
        let removed = self.entries.remove(index);
        self.persist();
        tracing::info!(queue_len = self.entries.len(), "removed request from queue");
        removed
    }

    /// Records the retry count reached by a drain attempt on a queued entry.
    pub(crate) fn record_retries(&mut self, id: &RequestId, retry_count: u32) {
        let Some(entry) = self.entries.iter_mut().find(|request| &request.id == id) else {
            return;
        };
        if entry.retry_count != retry_count {
            entry.retry_count = retry_count;
            self.persist();
        }
    }

    pub(crate) fn front(&self) -> Option<QueuedRequest> {
        self.entries.front().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn statuses(&self) -> Vec<QueueEntryStatus> {
        self.entries.iter().map(QueueEntryStatus::from).collect()
    }

    fn persist(&self) {
        let mutating: Vec<&QueuedRequest> = self
            .entries
            .iter()
            .filter(|request| request.is_mutating())
            .collect();

        let result = if mutating.is_empty() {
            self.storage.remove(PENDING_REQUESTS_KEY)
        } else {
            serde_json::to_string(&mutating)
                .map_err(StorageError::from)
                .and_then(|json| self.storage.set(PENDING_REQUESTS_KEY, &json))
        };

        match result {
            Ok(()) => tracing::debug!(saved = mutating.len(), "saved pending requests"),
            Err(err) => tracing::warn!(error = %err, "failed to save pending requests"),
        }
    }

    /// Appends `request` to the failure archive, evicting the oldest records
    /// beyond capacity.
    pub(crate) fn archive(&self, request: QueuedRequest) {
        tracing::error!(id = %request.id, url = %request.url, "request permanently failed");

        let mut records = self.failed();
        records.push(FailedRequestRecord::new(request));
        if records.len() > self.failed_capacity {
            let excess = records.len() - self.failed_capacity;
            records.drain(..excess);
        }

        let result = serde_json::to_string(&records)
            .map_err(StorageError::from)
            .and_then(|json| self.storage.set(FAILED_REQUESTS_KEY, &json));
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to archive failed request");
        }
    }

    pub(crate) fn failed(&self) -> Vec<FailedRequestRecord> {
        let raw = match self.storage.get(FAILED_REQUESTS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read failed requests");
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring unreadable failed requests");
            Vec::new()
        })
    }

    pub(crate) fn clear_failed(&self) {
        if let Err(err) = self.storage.remove(FAILED_REQUESTS_KEY) {
            tracing::warn!(error = %err, "failed to clear failed requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::RequestQueue;
    use crate::{
        request::{QueuedRequest, RequestConfig},
        storage::{MemoryStorage, Storage, FAILED_REQUESTS_KEY, PENDING_REQUESTS_KEY},
        HandlerOptions,
    };

    fn queue_with_storage() -> (RequestQueue, MemoryStorage) {
        let storage = MemoryStorage::new();
        (RequestQueue::new(Arc::new(storage.clone()), 100), storage)
    }

    fn stored_pending(storage: &MemoryStorage) -> Option<Vec<QueuedRequest>> {
        storage
            .get(PENDING_REQUESTS_KEY)
            .expect("read")
            .map(|raw| serde_json::from_str(&raw).expect("valid json"))
    }

    #[test]
    fn push_ignores_duplicate_ids() {
        let (mut queue, _) = queue_with_storage();
        let request = QueuedRequest::new("/a", RequestConfig::post("{}"));
        assert!(queue.push(request.clone()));
        assert!(!queue.push(request));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn only_mutating_requests_are_persisted() {
        let (mut queue, storage) = queue_with_storage();
        let post = QueuedRequest::new("/projects/create/project", RequestConfig::post("{}"));
        queue.push(QueuedRequest::new("/dashboard", RequestConfig::get()));
        queue.push(post.clone());

        assert_eq!(stored_pending(&storage), Some(vec![post]));
    }

    #[test]
    fn removing_last_mutating_request_clears_storage() {
        let (mut queue, storage) = queue_with_storage();
        let post = QueuedRequest::new("/a", RequestConfig::put("{}"));
        queue.push(post.clone());
        queue.push(QueuedRequest::new("/b", RequestConfig::get()));

        queue.remove(&post.id).expect("present");

        assert_eq!(stored_pending(&storage), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn load_moves_storage_into_memory_and_clears_it() {
        let storage = MemoryStorage::new();
        let request = QueuedRequest::new("/a", RequestConfig::delete());
        storage
            .set(
                PENDING_REQUESTS_KEY,
                &serde_json::to_string(&vec![request.clone()]).expect("json"),
            )
            .expect("seed");

        let mut queue = RequestQueue::new(Arc::new(storage.clone()), 100);
        assert_eq!(queue.load_persisted(), 1);
        assert_eq!(queue.front(), Some(request));
        assert_eq!(stored_pending(&storage), None);
    }

    #[test]
    fn retry_updates_are_mirrored() {
        let (mut queue, storage) = queue_with_storage();
        let request = QueuedRequest::new("/a", RequestConfig::post("{}"));
        queue.push(request.clone());
        queue.record_retries(&request.id, 2);

        let stored = stored_pending(&storage).expect("persisted");
        assert_eq!(stored[0].retry_count, 2);
    }

    #[test]
    fn archive_is_a_bounded_ring() {
        let storage = MemoryStorage::new();
        let queue = RequestQueue::new(Arc::new(storage.clone()), 3);
        let urls = ["/1", "/2", "/3", "/4"];
        for url in urls {
            queue.archive(QueuedRequest::new(url, RequestConfig::post("{}")));
        }

        let kept: Vec<String> = queue
            .failed()
            .into_iter()
            .map(|record| record.request.url)
            .collect();
        assert_eq!(kept, vec!["/2", "/3", "/4"]);

        queue.clear_failed();
        assert!(queue.failed().is_empty());
        assert_eq!(storage.get(FAILED_REQUESTS_KEY).expect("read"), None);
    }

    #[test]
    fn default_archive_keeps_the_newest_hundred() {
        let storage = MemoryStorage::new();
        let capacity = HandlerOptions::default().failed_capacity;
        let queue = RequestQueue::new(Arc::new(storage), capacity);
        for n in 0..=capacity {
            queue.archive(QueuedRequest::new(format!("/{n}"), RequestConfig::post("{}")));
        }

        let kept = queue.failed();
        assert_eq!(kept.len(), 100);
        assert_eq!(kept[0].request.url, "/1");
        assert_eq!(kept[99].request.url, "/100");
    }

    #[test]
    fn unreadable_archive_reads_as_empty() {
        let storage = MemoryStorage::new();
        storage.set(FAILED_REQUESTS_KEY, "not json").expect("seed");
        let queue = RequestQueue::new(Arc::new(storage), 100);
        assert!(queue.failed().is_empty());
    }
}
