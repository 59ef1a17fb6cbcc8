//! Chunking engine – splits an ordered record sequence into byte-budgeted
//! pages for upload.

use tracing::{debug, warn};

use crate::{Record, ResourceKind};

/// Hard cap on the serialized size of a single record. Records strictly
/// over the cap are dropped; records exactly at it are kept.
pub const MAX_ITEM_SIZE: usize = 1024 * 1500;

/// One byte-budgeted batch of records, the unit of transmission.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Record>,
    /// Sum of the records' serialized sizes.
    pub bytes: usize,
}

/// What the chunker left behind, for logs and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub dropped_oversize: usize,
    pub dropped_unserializable: usize,
}

impl ChunkStats {
    pub fn dropped(&self) -> usize {
        self.dropped_oversize + self.dropped_unserializable
    }
}

/// Split `records` into pages whose cumulative serialized size stays within
/// `budget` bytes. A page is flushed before a record that would push it over
/// budget, so only a record that alone exceeds the budget ever produces an
/// over-budget (single-record) page. Input order is preserved; the final
/// partial page is always flushed.
pub fn paginate(kind: ResourceKind, records: Vec<Record>, budget: usize) -> (Vec<Page>, ChunkStats) {
    let mut stats = ChunkStats::default();
    let mut pages = Vec::new();
    let mut current: Vec<Record> = Vec::new();
    let mut current_bytes = 0usize;

    for (idx, record) in records.into_iter().enumerate() {
        let size = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes.len(),
            Err(err) => {
                warn!(kind = %kind, index = idx, error = %err, "dropping unserializable record");
                stats.dropped_unserializable += 1;
                continue;
            }
        };
        if size > MAX_ITEM_SIZE {
            warn!(kind = %kind, index = idx, size, "dropping record over single-item cap");
            stats.dropped_oversize += 1;
            continue;
        }
        if current_bytes + size > budget && !current.is_empty() {
            pages.push(Page { records: std::mem::take(&mut current), bytes: current_bytes });
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(record);
    }
    if !current.is_empty() {
        pages.push(Page { records: current, bytes: current_bytes });
    }

    debug!(
        kind = %kind,
        pages = pages.len(),
        dropped = stats.dropped(),
        "chunked records into pages"
    );
    (pages, stats)
}
