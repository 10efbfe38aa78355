use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::ViewConfig;
use crate::cursor::StreamCursor;
use crate::error::QueryError;
use crate::fallback::{FallbackStateHandle, QueryFallbackChain};
use crate::query::{QueryDescriptor, Stage};
use crate::record::Record;
use crate::search;
use crate::source::{LogSource, ReadMode, RecordStream, Subscription};
use crate::views::{PageView, Renderer, ScrollContainer};

#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub done: bool,
    pub failed: Option<String>,
}

/// Status of the two pipelines. Each fails independently; an error in one
/// never stops the other.
#[derive(Debug, Clone, Default)]
pub struct FeedStatus {
    pub backward: PipelineStatus,
    pub forward: PipelineStatus,
}

enum FeedCommand {
    LoadMore,
    Scroll(i64),
}

/// Entries carrying the user's key as `dest`, authored by someone else and
/// not marked private. Stepped on receive order.
fn notifications_descriptor(self_id: &str, limit: u64) -> QueryDescriptor {
    QueryDescriptor::new(vec![Stage::Filter(json!({
        "dest": self_id,
        "timestamp": { "$gt": 0 },
        "value": {
            "author": { "$ne": self_id },
            "private": { "$ne": true }
        }
    }))])
    .limit(limit)
}

type RecordFilter = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// Where backward (historical) records come from: cursor-stepped pages, or
/// a search chain that may have degraded to a linear scan.
enum Backfill {
    Pages(StreamCursor),
    Search {
        chain: QueryFallbackChain,
        page_size: u64,
    },
}

/// Bidirectional paginated+live feed bound to one scrollable container.
///
/// The historical pipeline appends at the bottom as pages are pulled; the
/// live pipeline prepends at the top as records arrive. Both run
/// interleaved on one driver task, coordinated only by the shared
/// container, with no cross-pipeline locking and no cross-pipeline errors.
pub struct FeedView {
    commands: mpsc::UnboundedSender<FeedCommand>,
    live: Subscription,
    status: Arc<RwLock<FeedStatus>>,
    search_state: Option<FallbackStateHandle>,
    task: Option<JoinHandle<()>>,
}

impl FeedView {
    /// Feed over a stage-pipeline descriptor (notifications, query
    /// console). The descriptor is issued reversed+bounded for backfill
    /// and forward+live for the tail. `filter` runs client-side on both
    /// pipelines (e.g. dropping blocked authors).
    pub fn paginated<R, C>(
        source: Arc<dyn LogSource>,
        descriptor: QueryDescriptor,
        renderer: R,
        container: C,
        filter: Option<RecordFilter>,
    ) -> Result<Self, QueryError>
    where
        R: Renderer + Sync + 'static,
        C: ScrollContainer<Element = R::Element> + 'static,
    {
        let backward = descriptor.clone().reverse(true).live(false);
        let forward = descriptor.reverse(false).live(true).old(false);

        let live = source.query(&forward, ReadMode::Live)?;
        let cursor = StreamCursor::new(source, backward);
        Ok(Self::spawn(
            Backfill::Pages(cursor),
            live,
            renderer,
            container,
            filter,
            None,
        ))
    }

    /// Mentions feed: entries addressed to the user by anyone else, public
    /// only, with entries from authors the user blocks dropped client-side
    /// on both pipelines.
    pub fn notifications<R, C>(
        source: Arc<dyn LogSource>,
        self_id: &str,
        is_blocked: impl Fn(&str) -> bool + Send + Sync + 'static,
        renderer: R,
        container: C,
        config: &ViewConfig,
    ) -> Result<Self, QueryError>
    where
        R: Renderer + Sync + 'static,
        C: ScrollContainer<Element = R::Element> + 'static,
    {
        let descriptor = notifications_descriptor(self_id, config.page_size);
        let filter: RecordFilter = Box::new(move |record| {
            record
                .field(&["value", "author"])
                .and_then(|v| v.as_str())
                .map_or(true, |author| !is_blocked(author))
        });
        Self::paginated(source, descriptor, renderer, container, Some(filter))
    }

    /// Search feed: indexed query backward with linear-scan fallback, raw
    /// live tail forward filtered by the same predicate.
    pub fn search<R, C>(
        source: Arc<dyn LogSource>,
        query: &str,
        renderer: R,
        container: C,
        config: &ViewConfig,
    ) -> Result<Self, QueryError>
    where
        R: Renderer + Sync + 'static,
        C: ScrollContainer<Element = R::Element> + 'static,
    {
        let terms = search::parse_terms(query);

        let primary = match source.search(query, config.search_page_size) {
            Ok(stream) => stream,
            Err(err) if err.is_unavailable() => {
                // Surface the refusal through the stream so the chain
                // degrades the same way as a mid-stream refusal.
                let (tx, stream) = RecordStream::channel();
                tx.fail(err);
                stream
            }
            Err(err) => return Err(err),
        };

        let linear = QueryDescriptor::default().reverse(true);
        let fallback_source = source.clone();
        let chain_terms = terms.clone();
        let chain = QueryFallbackChain::new(
            primary,
            move || fallback_source.query(&linear, ReadMode::Bounded),
            move |record| search::matches_record(&chain_terms, record),
        );
        let search_state = chain.state();

        let live_descriptor = QueryDescriptor::default().live(true).old(false);
        let live = source.query(&live_descriptor, ReadMode::Live)?;
        let filter: RecordFilter =
            Box::new(move |record| search::matches_record(&terms, record));

        Ok(Self::spawn(
            Backfill::Search {
                chain,
                page_size: config.search_page_size,
            },
            live,
            renderer,
            container,
            Some(filter),
            Some(search_state),
        ))
    }

    fn spawn<R, C>(
        backfill: Backfill,
        live: RecordStream,
        renderer: R,
        container: C,
        filter: Option<RecordFilter>,
        search_state: Option<FallbackStateHandle>,
    ) -> Self
    where
        R: Renderer + Sync + 'static,
        C: ScrollContainer<Element = R::Element> + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(FeedStatus::default()));
        let live_subscription = live.subscription();
        let task = tokio::spawn(drive(
            backfill,
            live,
            renderer,
            container,
            filter,
            status.clone(),
            command_rx,
        ));
        // First page loads without waiting for a scroll.
        let _ = commands.send(FeedCommand::LoadMore);

        Self {
            commands,
            live: live_subscription,
            status,
            search_state,
            task: Some(task),
        }
    }

    /// Pull the next historical page (the "user scrolled to the bottom"
    /// hook). A no-op once the backfill is exhausted or torn down.
    pub fn load_more(&self) {
        let _ = self.commands.send(FeedCommand::LoadMore);
    }

    pub fn status(&self) -> FeedStatus {
        self.status.read().clone()
    }

    /// Fallback/mode/match state, present on search feeds.
    pub fn search_state(&self) -> Option<FallbackStateHandle> {
        self.search_state.clone()
    }
}

impl PageView for FeedView {
    fn scroll(&mut self, delta: i64) {
        let _ = self.commands.send(FeedCommand::Scroll(delta));
    }

    fn teardown(&mut self) {
        self.live.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FeedView {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn drive<R, C>(
    mut backfill: Backfill,
    mut live: RecordStream,
    renderer: R,
    mut container: C,
    filter: Option<RecordFilter>,
    status: Arc<RwLock<FeedStatus>>,
    mut commands: mpsc::UnboundedReceiver<FeedCommand>,
) where
    R: Renderer + Sync,
    C: ScrollContainer<Element = R::Element>,
{
    let mut live_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(FeedCommand::LoadMore) => {
                    if !status.read().backward.done {
                        load_batch(&mut backfill, &renderer, &mut container, &filter, &status)
                            .await;
                    }
                }
                Some(FeedCommand::Scroll(delta)) => container.scroll(delta),
                None => return,
            },
            item = live.next(), if live_open => match item {
                Some(Ok(record)) => {
                    if filter.as_ref().map_or(true, |f| f(&record)) {
                        container.prepend(renderer.render(&record));
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "live pipeline failed; historical side keeps running");
                    let mut s = status.write();
                    s.forward.failed = Some(err.to_string());
                    s.forward.done = true;
                    live_open = false;
                }
                None => {
                    status.write().forward.done = true;
                    live_open = false;
                }
            },
        }
    }
}

async fn load_batch<R, C>(
    backfill: &mut Backfill,
    renderer: &R,
    container: &mut C,
    filter: &Option<RecordFilter>,
    status: &Arc<RwLock<FeedStatus>>,
) where
    R: Renderer + Sync,
    C: ScrollContainer<Element = R::Element>,
{
    match backfill {
        Backfill::Pages(cursor) => match cursor.next_page().await {
            Ok(Some(records)) => {
                for record in &records {
                    if filter.as_ref().map_or(true, |f| f(record)) {
                        container.append(renderer.render(record));
                    }
                }
            }
            Ok(None) => status.write().backward.done = true,
            Err(err) => {
                warn!(error = %err, "historical pipeline failed; live side keeps running");
                let mut s = status.write();
                s.backward.failed = Some(err.to_string());
                s.backward.done = true;
            }
        },
        Backfill::Search { chain, page_size } => {
            let mut delivered = 0;
            while delivered < *page_size {
                match chain.next().await {
                    Some(record) => {
                        // The chain already applied the search predicate.
                        container.append(renderer.render(&record));
                        delivered += 1;
                    }
                    None => {
                        let snapshot = chain.state().snapshot();
                        let mut s = status.write();
                        s.backward.done = true;
                        s.backward.failed = snapshot.failed;
                        break;
                    }
                }
            }
        }
    }
}
