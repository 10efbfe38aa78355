use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate};
use parking_lot::RwLock;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collection::LiveMergeCollection;
use crate::error::QueryError;
use crate::query::{QueryDescriptor, Stage};
use crate::record::Record;
use crate::source::{LogSource, ReadMode, RecordStream, Subscription};
use crate::views::{Destination, Navigator, PageView, Renderer};
use crate::window::TimeWindow;

/// A gathering as the calendar shows it: the entry's key plus its claimed
/// start time. The full record is fetched on render.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub subject: String,
    pub date_millis: i64,
}

struct CalendarState {
    window: TimeWindow,
    year: i32,
    events: LiveMergeCollection<CalendarEvent>,
    attending: LiveMergeCollection<()>,
}

/// Calendar page: a month window over reconciled gathering announcements,
/// plus the user's own attendance set.
///
/// Gathering dates arrive as repeated announcements; the newest asserted
/// timestamp wins, so a reschedule replaces the date and a late replay of
/// an older announcement does not. Attendance folds the user's own
/// join/leave entries in delivery order.
pub struct CalendarView {
    source: Arc<dyn LogSource>,
    state: Arc<RwLock<CalendarState>>,
    gatherings: Option<(Subscription, JoinHandle<()>)>,
    attendance: Option<(Subscription, JoinHandle<()>)>,
}

impl CalendarView {
    pub fn new(
        source: Arc<dyn LogSource>,
        self_id: &str,
        today: NaiveDate,
    ) -> Result<Self, QueryError> {
        let state = Arc::new(RwLock::new(CalendarState {
            window: TimeWindow::month_of(today),
            year: today.year(),
            events: LiveMergeCollection::new(),
            attending: LiveMergeCollection::new(),
        }));

        let mut view = Self {
            source,
            state,
            gatherings: None,
            attendance: None,
        };
        view.spawn_gatherings()?;
        view.spawn_attendance(self_id)?;
        Ok(view)
    }

    fn spawn_gatherings(&mut self) -> Result<(), QueryError> {
        let year = self.state.read().year;
        let stream = self
            .source
            .query(&gatherings_descriptor(year), ReadMode::Live)?;
        let subscription = stream.subscription();
        let task = tokio::spawn(drive_gatherings(stream, self.state.clone()));
        self.gatherings = Some((subscription, task));
        Ok(())
    }

    fn spawn_attendance(&mut self, self_id: &str) -> Result<(), QueryError> {
        let stream = self
            .source
            .query(&attendance_descriptor(self_id), ReadMode::Live)?;
        let subscription = stream.subscription();
        let task = tokio::spawn(drive_attendance(stream, self.state.clone()));
        self.attendance = Some((subscription, task));
        Ok(())
    }

    pub fn window(&self) -> TimeWindow {
        self.state.read().window
    }

    /// Replace the window from an explicit cell selection. Inference on the
    /// next step picks up whatever shape was selected.
    pub fn select(&self, lower: NaiveDate, upper: NaiveDate) -> bool {
        self.state.write().window.set_from_selection(lower, upper)
    }

    /// Point the gatherings query at another year. Already-materialized
    /// events are kept; the new subscription only widens what is known.
    pub fn set_year(&mut self, year: i32) -> Result<(), QueryError> {
        if self.state.read().year == year {
            return Ok(());
        }
        if let Some((subscription, task)) = self.gatherings.take() {
            subscription.cancel();
            task.abort();
        }
        self.state.write().year = year;
        self.spawn_gatherings()
    }

    pub fn is_attending(&self, subject: &str) -> bool {
        self.state.read().attending.contains(subject)
    }

    pub fn attending_count(&self) -> usize {
        self.state.read().attending.len()
    }

    /// Events whose claimed start date falls inside the current window,
    /// in date order.
    pub fn events_in_window(&self) -> Vec<CalendarEvent> {
        let state = self.state.read();
        let window = state.window;
        state
            .events
            .sorted_by(|e| e.date_millis)
            .into_iter()
            .filter(|(_, e)| date_of(e.date_millis).is_some_and(|d| window.contains(d)))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Fetch and render the full record behind each visible event. Events
    /// whose record is not in the log yet are skipped, not errors.
    pub fn render_window<R: Renderer>(&self, renderer: &R) -> Result<Vec<R::Element>, QueryError> {
        let mut out = Vec::new();
        for event in self.events_in_window() {
            if let Some(record) = self.source.get(&event.subject)? {
                out.push(renderer.render(&record));
            }
        }
        Ok(out)
    }

    /// Open one gathering: hand the router a destination carrying the key.
    pub fn open(&self, navigator: &dyn Navigator, subject: &str) {
        navigator.go_to(Destination::page("gathering").with("key", subject));
    }
}

impl PageView for CalendarView {
    fn scroll(&mut self, delta: i64) {
        self.state.write().window.step(delta);
    }

    fn teardown(&mut self) {
        for slot in [self.gatherings.take(), self.attendance.take()] {
            if let Some((subscription, task)) = slot {
                subscription.cancel();
                task.abort();
            }
        }
    }
}

impl Drop for CalendarView {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Gathering announcements near one year: the target entry's key, the
/// claimed start time, and the asserted timestamp used as merge order.
fn gatherings_descriptor(year: i32) -> QueryDescriptor {
    QueryDescriptor::new(vec![
        Stage::Filter(json!({
            "value": {
                "timestamp": { "$gt": year_lower_millis(year), "$lt": year_upper_millis(year) },
                "content": {
                    "type": "about",
                    "startDateTime": { "epoch": { "$is": "number" } }
                }
            }
        })),
        Stage::Map(json!({
            "subject": ["value", "content", "about"],
            "date": ["value", "content", "startDateTime", "epoch"],
            "ts": ["value", "timestamp"]
        })),
    ])
    .live(true)
}

/// The user's own join/leave entries for any gathering.
fn attendance_descriptor(self_id: &str) -> QueryDescriptor {
    QueryDescriptor::new(vec![
        Stage::Filter(json!({
            "value": {
                "author": self_id,
                "content": {
                    "type": "about",
                    "about": { "$is": "string" },
                    "attendee": { "link": self_id }
                }
            }
        })),
        Stage::Map(json!({
            "subject": ["value", "content", "about"],
            "rm": ["value", "content", "attendee", "remove"]
        })),
    ])
    .live(true)
}

async fn drive_gatherings(mut stream: RecordStream, state: Arc<RwLock<CalendarState>>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(record) => apply_gathering(&record, &state),
            Err(err) => {
                warn!(error = %err, "gatherings stream failed");
                return;
            }
        }
    }
}

fn apply_gathering(record: &Record, state: &Arc<RwLock<CalendarState>>) {
    let Some(subject) = record.field(&["subject"]).and_then(|v| v.as_str()) else {
        return;
    };
    let Some(date_millis) = record.field_millis(&["date"]) else {
        return;
    };
    if date_millis <= 0 {
        debug!(subject, "ignoring gathering with unusable start date");
        return;
    }
    let order = record.field_millis(&["ts"]).unwrap_or(record.timestamp);
    let subject = subject.to_string();
    state.write().events.upsert(
        &subject,
        CalendarEvent {
            subject: subject.clone(),
            date_millis,
        },
        order,
    );
}

async fn drive_attendance(mut stream: RecordStream, state: Arc<RwLock<CalendarState>>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(record) => {
                let Some(subject) = record.field(&["subject"]).and_then(|v| v.as_str()) else {
                    continue;
                };
                let leaving = record
                    .field(&["rm"])
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                state.write().attending.set_membership(subject, !leaving);
            }
            Err(err) => {
                warn!(error = %err, "attendance stream failed");
                return;
            }
        }
    }
}

// Announcements from late December often schedule gatherings in the next
// year, so the asserted-timestamp bounds reach back a month before the
// subscription's nominal year.
fn year_lower_millis(year: i32) -> i64 {
    NaiveDate::from_ymd_opt(year - 1, 12, 1)
        .map(date_millis)
        .unwrap_or(i64::MIN)
}

fn year_upper_millis(year: i32) -> i64 {
    NaiveDate::from_ymd_opt(year + 1, 1, 1)
        .map(date_millis)
        .unwrap_or(i64::MAX)
}

fn date_millis(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .timestamp_millis()
}

fn date_of(millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryLog;
    use crate::window::WindowUnit;
    use parking_lot::Mutex;
    use std::time::Duration;

    const SELF: &str = "@self";

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        date_millis(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn announcement(key: &str, author: &str, asserted: i64, subject: &str, start: i64) -> Record {
        Record::new(
            key,
            asserted,
            json!({
                "key": key,
                "timestamp": asserted,
                "value": {
                    "author": author,
                    "timestamp": asserted,
                    "content": {
                        "type": "about",
                        "about": subject,
                        "startDateTime": { "epoch": start }
                    }
                }
            }),
        )
    }

    fn attendance(key: &str, author: &str, ts: i64, subject: &str, remove: bool) -> Record {
        let mut attendee = json!({ "link": author });
        if remove {
            attendee["remove"] = json!(true);
        }
        Record::new(
            key,
            ts,
            json!({
                "key": key,
                "timestamp": ts,
                "value": {
                    "author": author,
                    "timestamp": ts,
                    "content": { "type": "about", "about": subject, "attendee": attendee }
                }
            }),
        )
    }

    fn gathering_record(subject: &str, host: &str, ts: i64) -> Record {
        Record::new(
            subject,
            ts,
            json!({
                "key": subject,
                "timestamp": ts,
                "value": {
                    "author": host,
                    "timestamp": ts,
                    "content": { "type": "gathering" }
                }
            }),
        )
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn announcements_materialize_and_newest_asserted_wins() {
        let log = Arc::new(MemoryLog::new());
        log.append(announcement("%a1", "@host", ms(2024, 3, 1), "%g1", ms(2024, 3, 20)));
        let view = CalendarView::new(log.clone(), SELF, today()).unwrap();

        eventually(|| view.events_in_window().len() == 1).await;
        assert_eq!(view.events_in_window()[0].date_millis, ms(2024, 3, 20));

        // Reschedule arrives live with a newer asserted timestamp.
        log.append(announcement("%a2", "@host", ms(2024, 3, 2), "%g1", ms(2024, 3, 25)));
        eventually(|| view.events_in_window()[0].date_millis == ms(2024, 3, 25)).await;

        // A replayed older announcement must not move it back.
        log.append(announcement("%a0", "@host", ms(2024, 2, 28), "%g1", ms(2024, 3, 10)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(view.events_in_window()[0].date_millis, ms(2024, 3, 25));
    }

    #[tokio::test]
    async fn window_stepping_changes_which_events_show() {
        let log = Arc::new(MemoryLog::new());
        log.append(announcement("%a1", "@host", ms(2024, 3, 1), "%mar", ms(2024, 3, 20)));
        log.append(announcement("%a2", "@host", ms(2024, 3, 2), "%apr", ms(2024, 4, 5)));
        let mut view = CalendarView::new(log, SELF, today()).unwrap();

        // Widen until both events are in, then narrow back to March.
        view.select(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        );
        eventually(|| view.events_in_window().len() == 2).await;
        view.select(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        );
        let shown = view.events_in_window();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].subject, "%mar");

        view.scroll(1);
        assert_eq!(view.window().unit(), WindowUnit::Month);
        let shown = view.events_in_window();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].subject, "%apr");
    }

    #[tokio::test]
    async fn selection_narrows_the_window_and_steps_by_its_shape() {
        let log = Arc::new(MemoryLog::new());
        let mut view = CalendarView::new(log, SELF, today()).unwrap();

        assert!(view.select(
            NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 21).unwrap()
        ));
        assert_eq!(view.window().unit(), WindowUnit::Day);
        view.scroll(1);
        assert_eq!(
            view.window().lower(),
            NaiveDate::from_ymd_opt(2024, 3, 21).unwrap()
        );
    }

    #[tokio::test]
    async fn attendance_follows_own_entries_only() {
        let log = Arc::new(MemoryLog::new());
        log.append(attendance("%t1", SELF, ms(2024, 3, 1), "%g1", false));
        log.append(attendance("%t2", "@someone", ms(2024, 3, 2), "%g2", false));
        let view = CalendarView::new(log.clone(), SELF, today()).unwrap();

        eventually(|| view.is_attending("%g1")).await;
        assert!(!view.is_attending("%g2"));

        log.append(attendance("%t3", SELF, ms(2024, 3, 3), "%g1", true));
        eventually(|| !view.is_attending("%g1")).await;
        assert_eq!(view.attending_count(), 0);
    }

    #[tokio::test]
    async fn set_year_widens_without_discarding() {
        let log = Arc::new(MemoryLog::new());
        log.append(announcement("%a1", "@host", ms(2024, 3, 1), "%g24", ms(2024, 3, 20)));
        log.append(announcement("%a2", "@host", ms(2025, 3, 1), "%g25", ms(2025, 3, 20)));
        let mut view = CalendarView::new(log, SELF, today()).unwrap();

        eventually(|| view.events_in_window().len() == 1).await;

        view.set_year(2025).unwrap();
        view.select(
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
        );
        eventually(|| view.events_in_window().len() == 1).await;
        assert_eq!(view.events_in_window()[0].subject, "%g25");

        // The 2024 event is still materialized.
        view.select(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        );
        assert_eq!(view.events_in_window()[0].subject, "%g24");
    }

    #[tokio::test]
    async fn render_window_fetches_full_records_and_skips_missing() {
        struct TitleRenderer;
        impl Renderer for TitleRenderer {
            type Element = String;
            fn render(&self, item: &Record) -> String {
                item.key.clone()
            }
        }

        let log = Arc::new(MemoryLog::new());
        log.append(gathering_record("%g1", "@host", ms(2024, 2, 20)));
        log.append(announcement("%a1", "@host", ms(2024, 3, 1), "%g1", ms(2024, 3, 20)));
        // Announced but the gathering entry itself has not replicated yet.
        log.append(announcement("%a2", "@host", ms(2024, 3, 2), "%g2", ms(2024, 3, 21)));
        let view = CalendarView::new(log, SELF, today()).unwrap();

        eventually(|| view.events_in_window().len() == 2).await;
        let rendered = view.render_window(&TitleRenderer).unwrap();
        assert_eq!(rendered, ["%g1"]);
    }

    #[tokio::test]
    async fn open_routes_to_the_gathering_page() {
        #[derive(Default)]
        struct CapturingNavigator(Mutex<Vec<Destination>>);
        impl Navigator for CapturingNavigator {
            fn go_to(&self, destination: Destination) {
                self.0.lock().push(destination);
            }
        }

        let log = Arc::new(MemoryLog::new());
        let view = CalendarView::new(log, SELF, today()).unwrap();
        let navigator = CapturingNavigator::default();
        view.open(&navigator, "%g1");

        let sent = navigator.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.get("page"), Some(&json!("gathering")));
        assert_eq!(sent[0].0.get("key"), Some(&json!("%g1")));
    }

    #[tokio::test]
    async fn teardown_stops_updates_and_is_idempotent() {
        let log = Arc::new(MemoryLog::new());
        let mut view = CalendarView::new(log.clone(), SELF, today()).unwrap();
        view.teardown();
        view.teardown();

        log.append(announcement("%a1", "@host", ms(2024, 3, 1), "%g1", ms(2024, 3, 20)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(view.events_in_window().is_empty());
    }
}
