use std::collections::BTreeMap;

const MINUTE_MS: i64 = 60 * 1000;

/// Vertical axis rounding: displayed max is the tallest visible bucket
/// rounded up to the next multiple of the step, never below the floor.
pub const AXIS_STEP: u64 = 50;
pub const AXIS_MIN: u64 = 100;

/// Fixed-width time-bucket counter fed by a live stream, with a trailing
/// display window that advances on a clock tick whether or not data arrives.
#[derive(Debug, Clone)]
pub struct HistogramAggregator {
    bucket_width: i64,
    span: i64,
    counts: BTreeMap<i64, u64>,
    latest: i64,
}

impl HistogramAggregator {
    pub fn new(bucket_minutes: i64, span_millis: i64, now_millis: i64) -> Self {
        let bucket_width = bucket_minutes * MINUTE_MS;
        let latest = bucket_start(now_millis, bucket_width);
        // Seed both edges at zero so an empty chart still spans the window.
        let mut counts = BTreeMap::new();
        counts.insert(latest, 0);
        counts.insert(latest + bucket_width - span_millis, 0);
        Self {
            bucket_width,
            span: span_millis,
            counts,
            latest,
        }
    }

    pub fn bucket_width(&self) -> i64 {
        self.bucket_width
    }

    /// How often the display window should advance: a quarter bucket, as
    /// the original chart ticked.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis((self.bucket_width / 4).max(1) as u64)
    }

    /// Count one event into its bucket.
    pub fn record(&mut self, timestamp_millis: i64) {
        let bucket = bucket_start(timestamp_millis, self.bucket_width);
        *self.counts.entry(bucket).or_insert(0) += 1;
    }

    /// Clock tick: recompute the most recent bucket boundary. Advances the
    /// displayed range independent of data arrival.
    pub fn advance(&mut self, now_millis: i64) {
        self.latest = bucket_start(now_millis, self.bucket_width);
    }

    /// Displayed range: a trailing window of fixed span ending at the most
    /// recent bucket boundary, half-open `[lower, upper)`.
    pub fn range(&self) -> (i64, i64) {
        let upper = self.latest + self.bucket_width;
        (upper - self.span, upper)
    }

    /// Buckets inside the displayed range, in time order.
    pub fn bars_in_range(&self) -> Vec<(i64, u64)> {
        let (lower, upper) = self.range();
        self.counts
            .range(lower..upper)
            .map(|(&t, &n)| (t, n))
            .collect()
    }

    /// Vertical scale for the visible slice.
    pub fn axis_max(&self) -> u64 {
        let tallest = self
            .bars_in_range()
            .into_iter()
            .map(|(_, n)| n)
            .max()
            .unwrap_or(0);
        if tallest < AXIS_MIN {
            AXIS_MIN
        } else {
            tallest + (AXIS_STEP - tallest % AXIS_STEP)
        }
    }
}

fn bucket_start(timestamp: i64, width: i64) -> i64 {
    timestamp.div_euclid(width) * width
}
