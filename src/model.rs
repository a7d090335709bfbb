//! Messages passed between the pipeline stages.

/// OPA account number as supplied by the identifier list.
pub type Identifier = u64;

/// One ordered row of string cells destined for a CSV table.
pub type FlatRow = Vec<String>;

/// The unmodified response body for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    pub id: Identifier,
    pub payload: Vec<u8>,
}

impl RawResource {
    pub fn new(id: Identifier, payload: impl Into<Vec<u8>>) -> Self {
        Self { id, payload: payload.into() }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// Per-identifier outcome sent from a fetcher to its persister. The fetcher
/// dropping its sender is the end-of-span signal.
#[derive(Debug)]
pub enum FetchResult {
    Fetched(RawResource),
    Failed(Identifier),
    Skipped(Identifier),
}

/// One-shot notification a persister sends when its span is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanDone {
    pub worker: usize,
    pub fetched: usize,
    pub failed: Vec<Identifier>,
    pub skipped: usize,
    pub files_written: usize,
    pub write_failures: usize,
}
