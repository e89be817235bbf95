// Background writer for the log store
//
// The request path only enqueues into a bounded queue; a dedicated thread
// drains it and appends in batches, one locked read-modify-write per day
// file per batch. A full queue drops the record instead of waiting, so a
// slow disk or a contended lock never delays the instrumented request.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use super::{LogStore, StoreError};
use crate::constants::{STORE_BATCH_MAX, STORE_QUEUE_CAPACITY};
use crate::metrics::QueryLensMetrics;
use crate::record::QueryRecord;

#[derive(Default)]
struct ProgressState {
    written: u64,
    stopped: bool,
}

/// Records handled by the worker, so `flush` can wait for a point in the
/// queue
#[derive(Default)]
struct Progress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl Progress {
    fn advance(&self, count: usize) {
        self.state.lock().written += count as u64;
        self.changed.notify_all();
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }

    fn wait_for(&self, target: u64) {
        let mut state = self.state.lock();
        while state.written < target && !state.stopped {
            self.changed.wait(&mut state);
        }
    }
}

pub struct StoreWriter {
    sender: Option<mpsc::Sender<QueryRecord>>,
    worker: Option<JoinHandle<()>>,
    queued: AtomicU64,
    progress: Arc<Progress>,
}

impl StoreWriter {
    pub fn spawn(store: LogStore) -> Result<Self, StoreError> {
        Self::with_capacity(store, STORE_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: LogStore, capacity: usize) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let progress = Arc::new(Progress::default());
        let worker_progress = Arc::clone(&progress);

        let worker = std::thread::Builder::new()
            .name("querylens-store".to_string())
            .spawn(move || run_worker(store, receiver, worker_progress))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            queued: AtomicU64::new(0),
            progress,
        })
    }

    /// Queue `record` for persistence without waiting
    ///
    /// Returns false when the record was dropped.
    pub fn submit(&self, record: QueryRecord) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(record) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(e) => {
                QueryLensMetrics::global().store_dropped.inc();
                let (reason, record) = match e {
                    mpsc::error::TrySendError::Full(record) => ("queue full", record),
                    mpsc::error::TrySendError::Closed(record) => ("writer stopped", record),
                };
                tracing::warn!(
                    reason,
                    request_id = %record.request_id,
                    "Dropping query record"
                );
                false
            }
        }
    }

    /// Block until every record queued before this call has been handled
    pub fn flush(&self) {
        let target = self.queued.load(Ordering::Acquire);
        self.progress.wait_for(target);
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        // closing the queue lets the worker drain what is left and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Store writer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish()
    }
}

fn run_worker(store: LogStore, mut receiver: mpsc::Receiver<QueryRecord>, progress: Arc<Progress>) {
    let mut batch = Vec::with_capacity(STORE_BATCH_MAX);

    while let Some(record) = receiver.blocking_recv() {
        batch.push(record);
        while batch.len() < STORE_BATCH_MAX {
            match receiver.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        store.append_batch(&batch);
        progress.advance(batch.len());
        batch.clear();
    }

    progress.stop();
    tracing::debug!(dir = %store.dir().display(), "Store writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::constants::LOCK_FILE_NAME;
    use fs2::FileExt;
    use std::fs::{self, OpenOptions};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> LogStore {
        LogStore::new(&StorageConfig {
            path: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    fn record(id: i64) -> QueryRecord {
        QueryRecord::new("req-1", "primary", "SELECT * FROM users WHERE id = ?", vec![id.into()], 1.0)
    }

    #[test]
    fn test_flush_waits_for_queued_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let writer = StoreWriter::spawn(store.clone()).unwrap();

        let first = record(1);
        let date = first.timestamp.date_naive();
        assert!(writer.submit(first));
        for i in 2..=20 {
            assert!(writer.submit(record(i)));
        }

        writer.flush();
        assert_eq!(store.read(date, None).len(), 20);
    }

    #[test]
    fn test_submit_does_not_wait_for_locked_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let writer = StoreWriter::spawn(store.clone()).unwrap();

        let held = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.path().join(LOCK_FILE_NAME))
            .unwrap();
        held.lock_exclusive().unwrap();

        let first = record(1);
        let date = first.timestamp.date_naive();
        let started = Instant::now();
        assert!(writer.submit(first));
        assert!(writer.submit(record(2)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(store.read(date, None).is_empty());

        FileExt::unlock(&held).unwrap();
        writer.flush();
        assert_eq!(store.read(date, None).len(), 2);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let writer = StoreWriter::with_capacity(store.clone(), 1).unwrap();

        let held = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.path().join(LOCK_FILE_NAME))
            .unwrap();
        held.lock_exclusive().unwrap();

        // the worker takes at most one record before blocking on the lock
        let accepted = (0..5).filter(|i| writer.submit(record(*i))).count();
        assert!(accepted < 5);

        FileExt::unlock(&held).unwrap();
        writer.flush();
        let stored: usize = store
            .log_files()
            .iter()
            .map(|p| {
                serde_json::from_slice::<Vec<serde_json::Value>>(&fs::read(p).unwrap())
                    .unwrap()
                    .len()
            })
            .sum();
        assert_eq!(stored, accepted);
    }

    #[test]
    fn test_drop_drains_pending_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = record(1);
        let date = first.timestamp.date_naive();
        {
            let writer = StoreWriter::spawn(store.clone()).unwrap();
            writer.submit(first);
            writer.submit(record(2));
        }

        assert_eq!(store.read(date, None).len(), 2);
    }
}
