use std::sync::Arc;

use tracing::debug;

use crate::error::QueryError;
use crate::query::{QueryDescriptor, StepPath};
use crate::record::Record;
use crate::source::{LogSource, ReadMode};

/// Stable pagination stepper over a bounded read.
///
/// Each page's filter is tightened to start strictly after the previous
/// page's last step-field value, so a record is never emitted twice by the
/// same cursor. Stepping requires a limit, a recognizable step field, and
/// no reduce stage (reduced output has no step field identity); otherwise
/// the descriptor is issued as a single unbounded read.
pub struct StreamCursor {
    source: Arc<dyn LogSource>,
    descriptor: QueryDescriptor,
    step_path: Option<StepPath>,
    last_seen: Option<i64>,
    exhausted: bool,
}

impl StreamCursor {
    pub fn new(source: Arc<dyn LogSource>, descriptor: QueryDescriptor) -> Self {
        let step_path = descriptor.step_path();
        if descriptor.limit.is_none() || step_path.is_none() || descriptor.has_reduce() {
            debug!("cursor stepping disabled, will issue one unbounded read");
        }
        Self {
            source,
            descriptor,
            step_path,
            last_seen: None,
            exhausted: false,
        }
    }

    pub fn stepping_enabled(&self) -> bool {
        self.descriptor.limit.is_some()
            && self.step_path.is_some()
            && !self.descriptor.has_reduce()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Read the next page. `Ok(None)` signals end-of-stream; a mid-page
    /// stream error is terminal for the cursor.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>, QueryError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut opts = self.descriptor.clone();
        // A page is always a bounded read that must end; tailing a live
        // descriptor is the feed's job, never the cursor's.
        opts.live = false;
        let stepping = self.stepping_enabled();
        if stepping {
            if let (Some(path), Some(last)) = (self.step_path, self.last_seen) {
                opts.tighten(path, last);
            }
        }

        let mut stream = self.source.query(&opts, ReadMode::Bounded)?;
        let mut records = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => records.push(record),
                Err(err) => {
                    self.exhausted = true;
                    return Err(err);
                }
            }
        }

        if records.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        if !stepping {
            self.exhausted = true;
            return Ok(Some(records));
        }

        // A short page means the read ran out of matching records.
        if self
            .descriptor
            .limit
            .is_some_and(|limit| (records.len() as u64) < limit)
        {
            self.exhausted = true;
        }

        match self
            .step_path
            .and_then(|path| records.last().and_then(|r| path.value_of(r)))
        {
            Some(last) => self.last_seen = Some(last),
            None => {
                // Last record carries no step value; no safe next bound.
                debug!("cursor cannot derive next bound, stopping");
                self.exhausted = true;
            }
        }

        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Stage;
    use crate::source::MemoryLog;
    use serde_json::json;

    fn post(key: &str, ts: i64) -> Record {
        Record::new(
            key,
            ts,
            json!({
                "key": key,
                "timestamp": ts,
                "value": { "timestamp": ts, "content": { "type": "post" } }
            }),
        )
    }

    fn seeded(n: i64) -> Arc<MemoryLog> {
        let log = MemoryLog::new();
        for i in 1..=n {
            log.append(post(&format!("%{i}"), i * 10));
        }
        Arc::new(log)
    }

    fn stepped_descriptor(limit: u64) -> QueryDescriptor {
        QueryDescriptor::new(vec![Stage::Filter(json!({
            "timestamp": { "$gt": 0 }
        }))])
        .limit(limit)
    }

    #[tokio::test]
    async fn pages_never_re_emit_and_short_page_ends_the_cursor() {
        let log = seeded(5);
        let mut cursor = StreamCursor::new(log, stepped_descriptor(2));
        assert!(cursor.stepping_enabled());

        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            for record in &page {
                seen.push(record.key.clone());
            }
        }
        assert_eq!(seen, ["%1", "%2", "%3", "%4", "%5"]);
        assert!(cursor.is_exhausted());

        // Exhausted cursors issue no further reads.
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_last_page_requires_one_empty_read_to_finish() {
        let log = seeded(4);
        let mut cursor = StreamCursor::new(log, stepped_descriptor(2));

        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 2);
        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 2);
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reduce_disables_stepping() {
        let log = seeded(5);
        let descriptor = QueryDescriptor::new(vec![
            Stage::Filter(json!({ "timestamp": { "$gt": 0 } })),
            Stage::Reduce(json!({ "count": { "$count": true } })),
        ])
        .limit(2);
        let mut cursor = StreamCursor::new(log, descriptor);
        assert!(!cursor.stepping_enabled());

        // One read honoring the service-side limit, then done.
        assert!(cursor.next_page().await.unwrap().is_some());
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_limit_means_one_unbounded_read() {
        let log = seeded(5);
        let descriptor = QueryDescriptor::new(vec![Stage::Filter(json!({
            "timestamp": { "$gt": 0 }
        }))]);
        let mut cursor = StreamCursor::new(log, descriptor);
        assert!(!cursor.stepping_enabled());

        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 5);
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_descriptor_pages_still_terminate() {
        // A live flag on the descriptor must not leave a page awaiting an
        // unending tail.
        let log = seeded(3);
        let mut cursor = StreamCursor::new(log, stepped_descriptor(2).live(true));

        let drained = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            let mut seen = Vec::new();
            while let Some(page) = cursor.next_page().await.unwrap() {
                for record in &page {
                    seen.push(record.key.clone());
                }
            }
            seen
        })
        .await
        .expect("paging must not stall on the live tail");
        assert_eq!(drained, ["%1", "%2", "%3"]);
    }

    #[tokio::test]
    async fn reversed_cursor_walks_backwards() {
        let log = seeded(5);
        let descriptor = QueryDescriptor::new(vec![Stage::Filter(json!({
            "timestamp": { "$lt": 1_000 }
        }))])
        .reverse(true)
        .limit(2);
        let mut cursor = StreamCursor::new(log, descriptor);

        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            for record in &page {
                seen.push(record.key.clone());
            }
        }
        assert_eq!(seen, ["%5", "%4", "%3", "%2", "%1"]);
    }
}
