use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::QueryError;
use crate::record::Record;
use crate::source::RecordStream;

/// Which query mechanism a view is currently fed by. The transition to
/// `Fallback` is one-directional and happens at most once per view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Primary,
    Fallback,
}

/// Observable completion/mode state for UI messaging ("no matches" vs
/// "still searching" vs "searched N").
#[derive(Debug, Clone)]
pub struct FallbackState {
    pub mode: QueryMode,
    pub done: bool,
    pub matches: u64,
    /// Records examined on the linear-scan path. Stays zero on the
    /// primary path, which only delivers matches.
    pub scanned: u64,
    pub failed: Option<String>,
}

impl FallbackState {
    fn new() -> Self {
        Self {
            mode: QueryMode::Primary,
            done: false,
            matches: 0,
            scanned: 0,
            failed: None,
        }
    }
}

/// Cheap cloneable reader for a chain's state.
#[derive(Clone)]
pub struct FallbackStateHandle {
    inner: Arc<RwLock<FallbackState>>,
}

impl FallbackStateHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FallbackState::new())),
        }
    }

    pub fn snapshot(&self) -> FallbackState {
        self.inner.read().clone()
    }

    pub fn is_using_fallback(&self) -> bool {
        self.inner.read().mode == QueryMode::Fallback
    }

    pub fn is_done(&self) -> bool {
        self.inner.read().done
    }

    pub fn has_no_matches(&self) -> bool {
        let state = self.inner.read();
        state.done && state.matches == 0
    }
}

type FallbackFactory = Box<dyn FnOnce() -> Result<RecordStream, QueryError> + Send>;
type Predicate = Box<dyn Fn(&Record) -> bool + Send>;

/// Degrades from a preferred query mechanism to a documented fallback on
/// the mechanism-unavailable signature, at most once. Any other error is
/// terminal and reflected in the state, never retried into a third mode.
pub struct QueryFallbackChain {
    stream: RecordStream,
    fallback: Option<FallbackFactory>,
    predicate: Predicate,
    state: FallbackStateHandle,
}

impl QueryFallbackChain {
    /// `predicate` re-applies the query client-side on the fallback path;
    /// the primary mechanism is trusted to deliver matches only.
    pub fn new(
        primary: RecordStream,
        fallback: impl FnOnce() -> Result<RecordStream, QueryError> + Send + 'static,
        predicate: impl Fn(&Record) -> bool + Send + 'static,
    ) -> Self {
        Self {
            stream: primary,
            fallback: Some(Box::new(fallback)),
            predicate: Box::new(predicate),
            state: FallbackStateHandle::new(),
        }
    }

    pub fn state(&self) -> FallbackStateHandle {
        self.state.clone()
    }

    /// Cancellation handle for whichever stream is currently active.
    pub fn subscription(&self) -> crate::source::Subscription {
        self.stream.subscription()
    }

    /// Next matching record, or `None` once the chain is done or failed.
    pub async fn next(&mut self) -> Option<Record> {
        loop {
            match self.stream.next().await {
                Some(Ok(record)) => {
                    let on_fallback = {
                        let mut state = self.state.inner.write();
                        if state.mode == QueryMode::Fallback {
                            state.scanned += 1;
                        }
                        state.mode == QueryMode::Fallback
                    };
                    if on_fallback && !(self.predicate)(&record) {
                        continue;
                    }
                    self.state.inner.write().matches += 1;
                    return Some(record);
                }
                Some(Err(err)) if err.is_unavailable() && self.fallback.is_some() => {
                    warn!(error = %err, "preferred query mechanism unavailable, degrading");
                    self.state.inner.write().mode = QueryMode::Fallback;
                    let factory = match self.fallback.take() {
                        Some(f) => f,
                        None => continue,
                    };
                    match factory() {
                        Ok(stream) => self.stream = stream,
                        Err(err) => {
                            self.fail(err);
                            return None;
                        }
                    }
                }
                Some(Err(err)) => {
                    self.fail(err);
                    return None;
                }
                None => {
                    self.state.inner.write().done = true;
                    return None;
                }
            }
        }
    }

    fn fail(&self, err: QueryError) {
        let mut state = self.state.inner.write();
        state.done = true;
        state.failed = Some(err.to_string());
    }
}
