//! Tails NDJSON files into the document engine.
//!
//! Every `*.ndjson` object under a source location is read from the byte
//! offset reached so far; each new complete line becomes one document of
//! the source index. A trailing line without a newline is left for the next
//! poll. Files are visited in path order and documents are routed
//! deterministically, so replaying the files after a restart reproduces the
//! same shard sequence numbers.

use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use glacier_core::storage::StorageProviderRef;

use crate::engine::DocumentEngine;
use crate::error::{IngestError, IngestStorageSnafu, NotAnObjectSnafu, ParseDocumentSnafu};

/// Field of an input line used as the document id.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, Copy, Default)]
struct FileProgress {
    offset: usize,
    line: usize,
}

pub struct NdjsonSource {
    index: String,
    storage: StorageProviderRef,
    engine: Arc<DocumentEngine>,
    progress: HashMap<String, FileProgress>,
}

impl NdjsonSource {
    pub fn new(
        index: impl Into<String>,
        storage: StorageProviderRef,
        engine: Arc<DocumentEngine>,
    ) -> Self {
        Self {
            index: index.into(),
            storage,
            engine,
            progress: HashMap::new(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Index every new line, returning how many documents were indexed.
    ///
    /// Malformed lines are logged and skipped.
    pub async fn poll(&mut self) -> Result<usize, IngestError> {
        let paths = self
            .storage
            .list_with_prefix("")
            .await
            .context(IngestStorageSnafu {
                source_name: self.index.as_str(),
            })?;

        let mut indexed = 0;
        for path in paths.iter().filter(|p| p.as_ref().ends_with(".ndjson")) {
            let bytes = self.storage.get(path).await.context(IngestStorageSnafu {
                source_name: self.index.as_str(),
            })?;
            let key = path.to_string();
            let mut progress = self.progress.get(&key).copied().unwrap_or_default();

            if bytes.len() < progress.offset {
                warn!(path = %key, "File shrank, reading it again from the start");
                progress = FileProgress::default();
            }

            let unread = &bytes[progress.offset..];
            let Some(end) = unread.iter().rposition(|b| *b == b'\n') else {
                continue;
            };

            for raw in unread[..=end].split_inclusive(|b| *b == b'\n') {
                progress.offset += raw.len();
                progress.line += 1;

                let text = String::from_utf8_lossy(raw);
                if text.trim().is_empty() {
                    continue;
                }
                match parse_line(&key, progress.line, &text) {
                    Ok((id, source)) => {
                        self.engine
                            .index_document(&self.index, id.as_deref(), source)
                            .map_err(|_| IngestError::UnknownIndex {
                                index: self.index.clone(),
                            })?;
                        indexed += 1;
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed document"),
                }
            }
            self.progress.insert(key, progress);
        }

        if indexed > 0 {
            debug!(index = %self.index, documents = indexed, "Ingested documents");
        }
        Ok(indexed)
    }
}

/// Parse one NDJSON line into an optional id and the document source.
pub fn parse_line(
    path: &str,
    line: usize,
    text: &str,
) -> Result<(Option<String>, Map<String, Value>), IngestError> {
    let value: Value = serde_json::from_str(text).context(ParseDocumentSnafu { path, line })?;
    let Value::Object(mut source) = value else {
        return NotAnObjectSnafu { path, line }.fail();
    };

    let id = match source.remove(ID_FIELD) {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Ok((id, source))
}
