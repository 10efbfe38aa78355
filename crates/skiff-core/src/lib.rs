pub mod collection;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fallback;
pub mod histogram;
pub mod query;
pub mod record;
pub mod search;
pub mod source;
pub mod views;
pub mod window;

pub use collection::LiveMergeCollection;
pub use config::ViewConfig;
pub use cursor::StreamCursor;
pub use error::QueryError;
pub use fallback::{FallbackStateHandle, QueryFallbackChain, QueryMode};
pub use histogram::HistogramAggregator;
pub use query::{QueryDescriptor, Stage, StepPath};
pub use record::Record;
pub use source::{LogSource, MemoryLog, ReadMode, RecordStream, Subscription};
pub use views::{
    CalendarEvent, CalendarView, Destination, FeedStatus, FeedView, Navigator, PageView,
    PipelineStatus, Renderer, ScrollContainer, TrafficView,
};
pub use window::{TimeWindow, WindowUnit};
