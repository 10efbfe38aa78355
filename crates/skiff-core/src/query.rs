use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::record::{finite_millis, Record};

/// One stage of a query pipeline. Wire format is the original service's:
/// `{"$filter": {..}}`, `{"$map": {..}}`, `{"$reduce": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "$filter")]
    Filter(Value),
    #[serde(rename = "$map")]
    Map(Value),
    #[serde(rename = "$reduce")]
    Reduce(Value),
}

/// The field the log is naturally ordered by, used for cursor stepping.
/// Receive timestamp lives at the document root, asserted (publish)
/// timestamp under `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPath {
    Timestamp,
    ValueTimestamp,
}

impl StepPath {
    pub fn segments(&self) -> &'static [&'static str] {
        match self {
            Self::Timestamp => &["timestamp"],
            Self::ValueTimestamp => &["value", "timestamp"],
        }
    }

    /// The record's position on this axis, if it carries one.
    pub fn value_of(&self, record: &Record) -> Option<i64> {
        match self {
            Self::Timestamp => Some(record.timestamp),
            Self::ValueTimestamp => record.field_millis(self.segments()),
        }
    }
}

/// A query against the log: an ordered stage pipeline plus mode flags.
/// Pure data; replaying one against the same log state is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub query: Vec<Stage>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub live: bool,
    /// Include data already in the log. On by default, like the service.
    #[serde(default = "default_true")]
    pub old: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            reverse: false,
            live: false,
            old: true,
            limit: None,
        }
    }
}

impl QueryDescriptor {
    pub fn new(query: Vec<Stage>) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn old(mut self, old: bool) -> Self {
        self.old = old;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Structural validation of a raw descriptor, as the query console does
    /// before running user input: `query` must be an array and every stage's
    /// single key must be one of the three known operators.
    pub fn is_valid_raw(raw: &Value) -> bool {
        let Some(obj) = raw.as_object() else {
            return false;
        };
        let Some(stages) = obj.get("query").and_then(Value::as_array) else {
            return false;
        };
        stages.iter().all(|stage| {
            stage
                .as_object()
                .and_then(|o| o.keys().next())
                .map(|k| matches!(k.as_str(), "$filter" | "$map" | "$reduce"))
                .unwrap_or(false)
        })
    }

    pub fn has_reduce(&self) -> bool {
        self.query.iter().any(|s| matches!(s, Stage::Reduce(_)))
    }

    pub fn first_filter(&self) -> Option<&Value> {
        self.query.iter().find_map(|s| match s {
            Stage::Filter(f) => Some(f),
            _ => None,
        })
    }

    /// Infer the step field from the first filter stage. Only the two axes
    /// the log actually indexes are recognized; anything else means the
    /// query cannot be paginated.
    pub fn step_path(&self) -> Option<StepPath> {
        let filter = self.first_filter()?;
        if filter.get("timestamp").is_some() {
            Some(StepPath::Timestamp)
        } else if filter
            .get("value")
            .and_then(|v| v.get("timestamp"))
            .is_some()
        {
            Some(StepPath::ValueTimestamp)
        } else {
            None
        }
    }

    /// Tighten the first filter so the next read starts strictly after
    /// (before, when reversed) the given position on the step axis.
    pub fn tighten(&mut self, path: StepPath, last: i64) {
        let op = if self.reverse { "$lt" } else { "$gt" };
        if self.first_filter().is_none() {
            self.query.insert(0, Stage::Filter(json!({})));
        }
        let Some(filter) = self.query.iter_mut().find_map(|s| match s {
            Stage::Filter(f) => Some(f),
            _ => None,
        }) else {
            return;
        };

        let mut node = filter;
        for segment in path.segments() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Some(obj) = node.as_object_mut() {
            obj.insert(op.to_string(), json!(last));
        }
    }

    /// Run a record through the pipeline. `None` means filtered out.
    /// Reduce stages are passed through untouched; aggregation happens
    /// upstream or not at all (see the cursor's stepping rules).
    pub fn apply(&self, record: &Record) -> Option<Record> {
        let mut current = record.clone();
        for stage in &self.query {
            match stage {
                Stage::Filter(filter) => {
                    if !filter_matches(filter, Some(&current.payload)) {
                        return None;
                    }
                }
                Stage::Map(map) => {
                    current.payload = apply_map(map, &current.payload);
                }
                Stage::Reduce(_) => {}
            }
        }
        Some(current)
    }

    /// The worked example the query console ships with: recent posts,
    /// newest first, with a projection.
    pub fn example(now_millis: i64) -> Self {
        const DAY_MS: i64 = 24 * 60 * 60 * 1000;
        Self::new(vec![
            Stage::Filter(json!({
                "value": {
                    "timestamp": { "$gt": now_millis - DAY_MS },
                    "content": { "type": "post" }
                }
            })),
            Stage::Map(json!({
                "author": ["value", "author"],
                "text": ["value", "content", "text"],
                "ts": {
                    "received": ["timestamp"],
                    "asserted": ["value", "timestamp"]
                }
            })),
        ])
        .reverse(true)
        .limit(50)
    }
}

/// Structural match of a filter expression against a document node.
/// Operator keys (`$gt`, `$lte`, `$ne`, `$is`, ...) apply to the current
/// node; plain keys recurse. A missing field only satisfies `$ne`.
pub fn filter_matches(filter: &Value, doc: Option<&Value>) -> bool {
    match filter {
        Value::Object(map) => map.iter().all(|(key, expected)| match key.as_str() {
            "$gt" => compare(doc, expected, |o| o == std::cmp::Ordering::Greater),
            "$gte" => compare(doc, expected, |o| o != std::cmp::Ordering::Less),
            "$lt" => compare(doc, expected, |o| o == std::cmp::Ordering::Less),
            "$lte" => compare(doc, expected, |o| o != std::cmp::Ordering::Greater),
            "$ne" => doc.map_or(true, |d| d != expected),
            "$is" => type_matches(doc, expected),
            _ => filter_matches(expected, doc.and_then(|d| d.get(key))),
        }),
        other => doc == Some(other),
    }
}

fn compare(doc: Option<&Value>, expected: &Value, check: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let Some(doc) = doc else { return false };
    if let (Some(a), Some(b)) = (doc.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b).map(&check).unwrap_or(false);
    }
    if let (Some(a), Some(b)) = (doc.as_str(), expected.as_str()) {
        return check(a.cmp(b));
    }
    false
}

fn type_matches(doc: Option<&Value>, expected: &Value) -> bool {
    match (doc, expected.as_str()) {
        (Some(d), Some("string")) => d.is_string(),
        (Some(d), Some("number")) => d.is_number(),
        (Some(d), Some("boolean")) => d.is_boolean(),
        (Some(d), Some("object")) => d.is_object(),
        _ => false,
    }
}

/// Apply a `$map` projection: arrays are field paths into the document,
/// nested objects project recursively, anything else is a literal.
pub fn apply_map(map: &Value, doc: &Value) -> Value {
    match map {
        Value::Object(fields) => {
            let mut out = Map::new();
            for (name, spec) in fields {
                let value = match spec {
                    Value::Array(path) => walk_path(doc, path),
                    Value::Object(_) => apply_map(spec, doc),
                    literal => literal.clone(),
                };
                out.insert(name.clone(), value);
            }
            Value::Object(out)
        }
        _ => Value::Null,
    }
}

fn walk_path(doc: &Value, path: &[Value]) -> Value {
    let mut current = doc;
    for segment in path {
        let Some(key) = segment.as_str() else {
            return Value::Null;
        };
        match current.get(key) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Numeric millisecond value at a path, used when a mapped field carries
/// the ordering axis (e.g. an event's start time).
pub fn millis_at(doc: &Value, path: &[&str]) -> Option<i64> {
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }
    finite_millis(current)
}
