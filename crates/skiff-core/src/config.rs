/// Tunables for the per-page views. Defaults mirror the original client.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Page size for paginated feeds (notifications).
    pub page_size: u64,
    /// Page size for search reads, indexed or linear.
    pub search_page_size: u64,
    /// Traffic histogram bucket width.
    pub bucket_minutes: i64,
    /// Traffic histogram display span in milliseconds.
    pub span_millis: i64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        const DAY_MS: i64 = 24 * 60 * 60 * 1000;
        Self {
            page_size: 100,
            search_page_size: 500,
            bucket_minutes: 20,
            span_millis: DAY_MS,
        }
    }
}
