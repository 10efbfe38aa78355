//! Per-page orchestration: each view owns its queries, its materialized
//! state, and the subscriptions feeding it, for the lifetime of one page.
//! Presentation is an external collaborator behind the three traits below.

pub mod calendar;
pub mod feed;
pub mod traffic;

pub use calendar::{CalendarEvent, CalendarView};
pub use feed::{FeedStatus, FeedView, PipelineStatus};
pub use traffic::TrafficView;

use serde_json::{Map, Value};

use crate::record::Record;

/// Opaque routing descriptor handed to the navigation callback. The engine
/// never interprets the fields, it only passes them through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Destination(pub Map<String, Value>);

impl Destination {
    pub fn page(name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("page".to_string(), Value::String(name.to_string()));
        Self(fields)
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }
}

/// Navigation callback: takes the user somewhere else.
pub trait Navigator: Send {
    fn go_to(&self, destination: Destination);
}

/// Turns one materialized record into a display element. Pure; the engine
/// assumes no side effects.
pub trait Renderer: Send {
    type Element: Send;
    fn render(&self, item: &Record) -> Self::Element;
}

/// Display-agnostic scrollable container. The two pipelines of a
/// bidirectional feed share exactly this and nothing else.
pub trait ScrollContainer: Send {
    type Element;
    fn append(&mut self, element: Self::Element);
    fn prepend(&mut self, element: Self::Element);
    /// Directional scroll selecting a focal child.
    fn scroll(&mut self, delta: i64);
}

/// What every page shape has in common: a scroll hook and a deterministic,
/// idempotent teardown on navigation.
pub trait PageView {
    fn scroll(&mut self, delta: i64);
    fn teardown(&mut self);
}
