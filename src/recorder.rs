//! Asynchronous crawler access recording
//!
//! The request path only enqueues; a single worker drains the queue into a
//! [`RecordSink`]. A full queue drops the record rather than stalling traffic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One crawler visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub domain: String,
    pub path: String,
    pub user_agent: String,
    pub spider: String,
    /// Unix seconds
    pub created_time: i64,
}

impl Record {
    pub fn now(domain: &str, path: &str, user_agent: &str, spider: &str) -> Self {
        Self {
            domain: domain.to_string(),
            path: path.to_string(),
            user_agent: user_agent.to_string(),
            spider: spider.to_string(),
            created_time: chrono::Utc::now().timestamp(),
        }
    }
}

/// Destination of drained records
pub trait RecordSink: Send + Sync + 'static {
    fn write(&self, record: &Record) -> anyhow::Result<()>;
}

#[derive(Default)]
struct RecorderStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
}

pub struct AccessRecorder {
    sender: Mutex<Option<mpsc::Sender<Record>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RecorderStats>,
}

impl AccessRecorder {
    /// Start the drain worker. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn RecordSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Record>(capacity.max(1));
        let stats = Arc::new(RecorderStats::default());
        let worker_stats = stats.clone();

        let worker = tokio::task::spawn_blocking(move || {
            while let Some(record) = rx.blocking_recv() {
                match sink.write(&record) {
                    Ok(()) => {
                        worker_stats.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(domain = %record.domain, "Failed to store access record: {:#}", e),
                }
            }
            debug!("Access recorder drained");
        });

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// A recorder that discards everything
    pub fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            stats: Arc::new(RecorderStats::default()),
        }
    }

    /// Enqueue without blocking
    pub fn record(&self, record: Record) {
        let guard = self.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(domain = %record.domain, dropped, "Access record queue full, dropping");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Stop accepting records and wait for the worker to drain the queue
    pub async fn close(&self, timeout: Duration) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::time::timeout(timeout, worker).await {
                Ok(_) => info!(
                    written = self.written(),
                    dropped = self.dropped(),
                    "Access recorder closed"
                ),
                Err(_) => warn!("Access recorder did not drain within {:?}", timeout),
            }
        }
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<Record>>,
    }

    impl RecordSink for MemorySink {
        fn write(&self, record: &Record) -> anyhow::Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    struct SlowSink;

    impl RecordSink for SlowSink {
        fn write(&self, _record: &Record) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_records_are_drained_on_close() {
        let sink = Arc::new(MemorySink::default());
        let recorder = AccessRecorder::spawn(sink.clone(), 16);
        for i in 0..5 {
            recorder.record(Record::now("a.com", &format!("/{i}"), "Baiduspider", "baiduspider"));
        }
        recorder.close(Duration::from_secs(5)).await;

        assert_eq!(recorder.accepted(), 5);
        assert_eq!(recorder.written(), 5);
        let records = sink.records.lock();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].path, "/0");
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let recorder = AccessRecorder::spawn(Arc::new(SlowSink), 1);
        for _ in 0..20 {
            recorder.record(Record::now("a.com", "/", "ua", "spider"));
        }
        assert!(recorder.dropped() > 0);
        assert_eq!(recorder.accepted() + recorder.dropped(), 20);
        recorder.close(Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn test_record_after_close_is_ignored() {
        let sink = Arc::new(MemorySink::default());
        let recorder = AccessRecorder::spawn(sink.clone(), 4);
        recorder.close(Duration::from_secs(1)).await;
        recorder.record(Record::now("a.com", "/", "ua", "spider"));
        assert_eq!(recorder.accepted(), 0);
        assert!(sink.records.lock().is_empty());
    }

    #[test]
    fn test_disabled_recorder() {
        let recorder = AccessRecorder::disabled();
        recorder.record(Record::now("a.com", "/", "ua", "spider"));
        assert_eq!(recorder.accepted(), 0);
        assert_eq!(recorder.dropped(), 0);
    }
}
