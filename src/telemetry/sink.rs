//! Append-only telemetry log shared between the dispatcher and consumers
//!
//! The dispatcher writes through a [`TelemetrySink`]; any number of
//! [`TelemetryFeed`] handles read it. Records are never removed, so a
//! subscriber sees every record appended after it subscribed, in order.

use super::record::TelemetryRecord;
use futures::Stream;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct TelemetryLog {
    records: RwLock<Vec<TelemetryRecord>>,
}

impl TelemetryLog {
    fn read(&self) -> RwLockReadGuard<'_, Vec<TelemetryRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected writer/reader pair over an empty log
pub fn telemetry_channel() -> (TelemetrySink, TelemetryFeed) {
    let log = Arc::new(TelemetryLog::default());
    let (len_tx, len_rx) = watch::channel(0usize);
    let sink = TelemetrySink {
        log: log.clone(),
        len_tx: Arc::new(len_tx),
    };
    let feed = TelemetryFeed { log, len_rx };
    (sink, feed)
}

/// Write side of the log
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    log: Arc<TelemetryLog>,
    len_tx: Arc<watch::Sender<usize>>,
}

impl TelemetrySink {
    pub fn append(&self, record: TelemetryRecord) {
        self.extend(std::iter::once(record));
    }

    /// Append a batch atomically; returns how many records were added
    pub fn extend(&self, records: impl IntoIterator<Item = TelemetryRecord>) -> usize {
        let (added, len) = {
            let mut guard = self
                .log
                .records
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = guard.len();
            guard.extend(records);
            (guard.len() - before, guard.len())
        };
        if added > 0 {
            self.len_tx.send_replace(len);
        }
        added
    }

    pub fn feed(&self) -> TelemetryFeed {
        TelemetryFeed {
            log: self.log.clone(),
            len_rx: self.len_tx.subscribe(),
        }
    }
}

/// Read side of the log
///
/// Subscriptions end once every [`TelemetrySink`] handle is dropped and the
/// remaining records have been yielded.
#[derive(Debug, Clone)]
pub struct TelemetryFeed {
    log: Arc<TelemetryLog>,
    len_rx: watch::Receiver<usize>,
}

impl TelemetryFeed {
    /// Records appended from now on
    pub fn observe(&self) -> TelemetrySubscription {
        self.observe_from(self.len())
    }

    /// Records starting at `index`, replaying history first
    pub fn observe_from(&self, index: usize) -> TelemetrySubscription {
        let mut len_rx = self.len_rx.clone();
        len_rx.borrow_and_update();
        TelemetrySubscription {
            log: self.log.clone(),
            len_rx,
            cursor: index,
        }
    }

    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.log.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<TelemetryRecord> {
        self.log.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cursor into the log
#[derive(Debug)]
pub struct TelemetrySubscription {
    log: Arc<TelemetryLog>,
    len_rx: watch::Receiver<usize>,
    cursor: usize,
}

impl TelemetrySubscription {
    /// Index of the next record this subscription yields
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn try_next(&mut self) -> Option<TelemetryRecord> {
        let record = self.log.read().get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(record)
    }

    /// Wait for the next record; `None` once the writers are gone and the log is drained
    pub async fn next(&mut self) -> Option<TelemetryRecord> {
        loop {
            if let Some(record) = self.try_next() {
                return Some(record);
            }
            if self.len_rx.changed().await.is_err() {
                return self.try_next();
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = TelemetryRecord> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|record| (record, subscription))
        }))
    }
}
