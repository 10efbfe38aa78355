use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::warn;

use crate::error::QueryError;
use crate::query::QueryDescriptor;
use crate::record::Record;
use crate::search;

/// How a query is read: a bounded historical page, or a live tail that
/// keeps delivering after the historical portion is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Bounded,
    Live,
}

/// Cancellation handle for one stream. Cloning shares the handle;
/// cancelling is idempotent, safe after the stream has ended, and wakes
/// both halves: a consumer parked in `next` and a producer parked in
/// `cancelled`.
#[derive(Debug, Clone)]
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Push-delivered stream of records. The channel closing cleanly is
/// end-of-stream; an `Err` item is the stream's terminal error.
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::UnboundedReceiver<Result<Record, QueryError>>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl RecordStream {
    pub fn channel() -> (StreamSender, RecordStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        (
            StreamSender {
                tx,
                cancelled: cancelled.clone(),
                notify: notify.clone(),
            },
            RecordStream {
                rx,
                cancelled,
                notify,
            },
        )
    }

    /// Next delivery, or `None` once the stream has ended or been cancelled.
    pub async fn next(&mut self) -> Option<Result<Record, QueryError>> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before the flag check so a cancel landing in
        // between still wakes the select below.
        notified.as_mut().enable();
        if self.cancelled.load(Ordering::Relaxed) {
            self.rx.close();
            return None;
        }
        tokio::select! {
            item = self.rx.recv() => item,
            _ = notified => {
                self.rx.close();
                None
            }
        }
    }

    pub fn subscription(&self) -> Subscription {
        Subscription {
            cancelled: self.cancelled.clone(),
            notify: self.notify.clone(),
        }
    }
}

/// Producer half of a record stream. Dropping it ends the stream cleanly.
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Result<Record, QueryError>>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StreamSender {
    /// Deliver one record. Returns false when the consumer is gone or the
    /// subscription was cancelled; producers should stop then.
    pub fn send(&self, record: Record) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return false;
        }
        self.tx.send(Ok(record)).is_ok()
    }

    /// Deliver the stream's terminal error.
    pub fn fail(&self, error: QueryError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Resolves when the consumer cancels or goes away, so producers
    /// parked on an idle upstream can stop without waiting for the next
    /// delivery attempt.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.cancelled.load(Ordering::Relaxed) || self.tx.is_closed() {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// The log service, as the view engine sees it: a function from a query
/// descriptor and read mode to a stream of records or an error. Transport,
/// storage and replication all live behind this seam.
pub trait LogSource: Send + Sync {
    fn query(
        &self,
        descriptor: &QueryDescriptor,
        mode: ReadMode,
    ) -> Result<RecordStream, QueryError>;

    /// Fetch one entry by key.
    fn get(&self, key: &str) -> Result<Option<Record>, QueryError>;

    /// Indexed full-text search. Services without the index refuse with the
    /// `no source` signature, which is what drives the fallback chain.
    fn search(&self, query: &str, limit: u64) -> Result<RecordStream, QueryError> {
        let _ = (query, limit);
        Err(QueryError::unavailable("for search"))
    }
}

/// In-process log used by tests and the query console. Plays the role the
/// real replicated service does: applies the stage pipeline, honors
/// reverse/limit/old, and tails appends when asked to go live.
pub struct MemoryLog {
    records: Arc<RwLock<Vec<Record>>>,
    live_tx: broadcast::Sender<Record>,
    indexed: bool,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(1024);
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            live_tx,
            indexed: true,
        }
    }

    /// A log whose service has no full-text index plugin loaded.
    pub fn without_index(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn append(&self, record: Record) {
        self.records.write().push(record.clone());
        // No receivers is fine; nobody is tailing yet.
        let _ = self.live_tx.send(record);
    }

    /// Validate and append a raw document. Returns false when the document
    /// is malformed and was dropped.
    pub fn append_raw(&self, raw: &Value) -> bool {
        match Record::from_value(raw) {
            Some(record) => {
                self.append(record);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl LogSource for MemoryLog {
    fn query(
        &self,
        descriptor: &QueryDescriptor,
        mode: ReadMode,
    ) -> Result<RecordStream, QueryError> {
        let descriptor = descriptor.clone();
        let (tx, stream) = RecordStream::channel();

        let live = mode == ReadMode::Live || descriptor.live;
        // Subscribe before snapshotting so appends racing the snapshot are
        // not lost; duplicates are the consumer's problem (it dedupes).
        let live_rx = live.then(|| self.live_tx.subscribe());
        let history: Vec<Record> = if descriptor.old {
            self.records.read().clone()
        } else {
            Vec::new()
        };

        tokio::spawn(async move {
            let mut sent: u64 = 0;
            let ordered: Vec<&Record> = if descriptor.reverse {
                history.iter().rev().collect()
            } else {
                history.iter().collect()
            };
            for record in ordered {
                if !tx.is_live() {
                    return;
                }
                if let Some(out) = descriptor.apply(record) {
                    if !tx.send(out) {
                        return;
                    }
                    sent += 1;
                    if descriptor.limit.is_some_and(|limit| sent >= limit) {
                        return;
                    }
                }
            }

            let Some(mut live_rx) = live_rx else {
                return; // bounded read: dropping the sender ends the stream
            };
            loop {
                tokio::select! {
                    _ = tx.cancelled() => return,
                    received = live_rx.recv() => match received {
                        Ok(record) => {
                            if let Some(out) = descriptor.apply(&record) {
                                if !tx.send(out) {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "live tail lagged, records skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(stream)
    }

    fn get(&self, key: &str) -> Result<Option<Record>, QueryError> {
        Ok(self.records.read().iter().find(|r| r.key == key).cloned())
    }

    fn search(&self, query: &str, limit: u64) -> Result<RecordStream, QueryError> {
        if !self.indexed {
            return Err(QueryError::unavailable("for search"));
        }
        let terms = search::parse_terms(query);
        let (tx, stream) = RecordStream::channel();
        let matches: Vec<Record> = self
            .records
            .read()
            .iter()
            .rev() // newest first, like the indexed query
            .filter(|r| search::matches_record(&terms, r))
            .take(limit as usize)
            .cloned()
            .collect();
        tokio::spawn(async move {
            for record in matches {
                if !tx.send(record) {
                    return;
                }
            }
        });
        Ok(stream)
    }
}
