//! Chunked log tailing.

use crate::config::SourceConfig;
use crate::error::SourceResult;
use logship_core::{Database, Tick};
use logship_protocol::{encoded_len, Chunk, FollowRequest, ProtocolError};
use std::sync::Arc;

/// Serves bounded chunks of the replication log.
///
/// A chunk holds the entries after the requested tick, in order, until
/// adding the next entry would push the encoded size past the chunk size.
/// The first entry is always included, so a single oversized entry still
/// makes progress. The tailer only reads, so any number of replicas may
/// follow the same log concurrently.
pub struct LogTailer {
    db: Arc<Database>,
    config: SourceConfig,
}

impl LogTailer {
    /// Creates a tailer.
    pub fn new(db: Arc<Database>, config: SourceConfig) -> Self {
        Self { db, config }
    }

    /// Returns the entries after `request.from_tick`.
    pub fn follow(&self, request: &FollowRequest) -> SourceResult<Chunk> {
        let limit = self.config.clamp_chunk_size(request.chunk_size);
        self.fetch_chunk(&request.from_tick, limit)
    }

    /// Returns the entries after `after`, bounded by `max_bytes`.
    pub fn fetch_chunk(&self, after: &Tick, max_bytes: u64) -> SourceResult<Chunk> {
        let log = self.db.log();
        let from_present = log.is_present(after);

        let mut entries = Vec::new();
        let mut size = 0u64;
        let mut failure: Option<ProtocolError> = None;
        log.scan_after(after, |entry| match encoded_len(entry) {
            Ok(len) => {
                let len = len as u64;
                if !entries.is_empty() && size + len > max_bytes {
                    return false;
                }
                size += len;
                entries.push(entry.clone());
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        });
        if let Some(err) = failure {
            return Err(err.into());
        }

        // Read after scanning so the reported tick covers every returned entry.
        let available_tick = log.last_tick();
        tracing::trace!(
            from = %after,
            entries = entries.len(),
            bytes = size,
            available = %available_tick,
            "served chunk"
        );
        Ok(Chunk::new(entries, available_tick, from_present))
    }
}
