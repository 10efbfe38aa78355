use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::ViewConfig;
use crate::error::QueryError;
use crate::histogram::HistogramAggregator;
use crate::query::{QueryDescriptor, Stage};
use crate::source::{LogSource, ReadMode, RecordStream, Subscription};
use crate::views::PageView;

/// Replication traffic page: a live histogram of entries received from
/// other authors, bucketed by receive time, with a trailing display window
/// that advances on a clock tick even when nothing arrives.
pub struct TrafficView {
    histogram: Arc<RwLock<HistogramAggregator>>,
    feed: Option<(Subscription, JoinHandle<()>)>,
    ticker: Option<JoinHandle<()>>,
}

impl TrafficView {
    pub fn new(
        source: Arc<dyn LogSource>,
        self_id: &str,
        config: &ViewConfig,
        now_millis: i64,
    ) -> Result<Self, QueryError> {
        let histogram = Arc::new(RwLock::new(HistogramAggregator::new(
            config.bucket_minutes,
            config.span_millis,
            now_millis,
        )));

        let descriptor = traffic_descriptor(self_id, now_millis - config.span_millis);
        let stream = source.query(&descriptor, ReadMode::Live)?;
        let subscription = stream.subscription();
        let feed = tokio::spawn(drive(stream, histogram.clone()));

        let tick_histogram = histogram.clone();
        let tick_interval = histogram.read().tick_interval();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                tick_histogram
                    .write()
                    .advance(Utc::now().timestamp_millis());
            }
        });

        Ok(Self {
            histogram,
            feed: Some((subscription, feed)),
            ticker: Some(ticker),
        })
    }

    pub fn bars(&self) -> Vec<(i64, u64)> {
        self.histogram.read().bars_in_range()
    }

    pub fn range(&self) -> (i64, i64) {
        self.histogram.read().range()
    }

    pub fn axis_max(&self) -> u64 {
        self.histogram.read().axis_max()
    }

    /// Move the display window forward by hand, same as one clock tick.
    pub fn advance(&self, now_millis: i64) {
        self.histogram.write().advance(now_millis);
    }
}

impl PageView for TrafficView {
    fn scroll(&mut self, _delta: i64) {
        // The chart is not scrollable; the window only moves with time.
    }

    fn teardown(&mut self) {
        if let Some((subscription, task)) = self.feed.take() {
            subscription.cancel();
            task.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for TrafficView {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Entries received within the window from anyone but the user, projected
/// down to the receive timestamp.
fn traffic_descriptor(self_id: &str, lower_millis: i64) -> QueryDescriptor {
    QueryDescriptor::new(vec![
        Stage::Filter(json!({
            "timestamp": { "$gte": lower_millis },
            "value": { "author": { "$ne": self_id } }
        })),
        Stage::Map(json!({ "ts": ["timestamp"] })),
    ])
    .live(true)
}

async fn drive(mut stream: RecordStream, histogram: Arc<RwLock<HistogramAggregator>>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(record) => {
                let ts = record.field_millis(&["ts"]).unwrap_or(record.timestamp);
                histogram.write().record(ts);
            }
            Err(err) => {
                warn!(error = %err, "traffic stream failed");
                return;
            }
        }
    }
}
