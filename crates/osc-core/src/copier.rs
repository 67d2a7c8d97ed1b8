//! Chunked row copy from the original table into the ghost table
//!
//! `ChunkIterator` owns the cursor and validates every chunk boundary the
//! database hands back; `RowCopier` drives it, honouring the throttle and
//! retrying transient copy failures on unchanged boundaries.

use crate::config::MAX_RETRIES;
use crate::context::MigrationContext;
use crate::db::Applier;
use crate::error::{MigrationError, Phase};
use crate::retry::retry_transient;
use crate::throttler::wait_while_throttled;
use crate::types::{ColumnValues, KeyRange};
use chrono::Utc;
use std::sync::Arc;

/// What to ask the database for next: keys in `(after, upper]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Exclusive lower bound; `None` before the first chunk
    pub after: Option<ColumnValues>,
    /// Inclusive upper bound, the global maximum
    pub upper: ColumnValues,
}

/// Cursor over the migration key's global range
///
/// Chunks are disjoint, ordered and contiguous in key order: every chunk
/// starts at the first key after the previous chunk's end.
#[derive(Debug, Clone)]
pub struct ChunkIterator {
    global: Option<KeyRange>,
    cursor: Option<ColumnValues>,
    exhausted: bool,
}

impl ChunkIterator {
    /// Iterate over `global`; `None` means an empty table
    #[must_use]
    pub fn new(global: Option<KeyRange>) -> Self {
        let exhausted = global.is_none();
        Self {
            global,
            cursor: None,
            exhausted,
        }
    }

    /// Upper bound of the last accepted chunk
    #[must_use]
    pub fn cursor(&self) -> Option<&ColumnValues> {
        self.cursor.as_ref()
    }

    /// Whether the range has been fully handed out
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The next bounds query, or `None` once exhausted
    #[must_use]
    pub fn pending(&self) -> Option<ChunkRequest> {
        if self.exhausted {
            return None;
        }
        let global = self.global.as_ref()?;
        Some(ChunkRequest {
            after: self.cursor.clone(),
            upper: global.max.clone(),
        })
    }

    /// Accept the bounds answered for `pending()` and move the cursor
    ///
    /// `None` from the database exhausts the iterator.
    ///
    /// # Errors
    /// `MigrationError::ChunkRegression` if the chunk is inverted, does not
    /// start after the cursor, or leaves the global range.
    pub fn advance(&mut self, bounds: Option<KeyRange>) -> Result<Option<KeyRange>, MigrationError> {
        let (Some(chunk), Some(global)) = (bounds, self.global.as_ref()) else {
            self.exhausted = true;
            return Ok(None);
        };

        let regression = |cursor: &dyn std::fmt::Display, found: &ColumnValues| {
            MigrationError::ChunkRegression {
                cursor: cursor.to_string(),
                found: found.to_string(),
            }
        };

        if chunk.min > chunk.max {
            return Err(regression(&chunk.max, &chunk.min));
        }
        match &self.cursor {
            Some(cursor) if chunk.min <= *cursor => return Err(regression(cursor, &chunk.min)),
            None if chunk.min < global.min => return Err(regression(&global.min, &chunk.min)),
            _ => {}
        }
        if chunk.max > global.max {
            return Err(regression(&global.max, &chunk.max));
        }

        if chunk.max == global.max {
            self.exhausted = true;
        }
        self.cursor = Some(chunk.max.clone());
        Ok(Some(chunk))
    }
}

/// Outcome of a finished copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Chunks copied
    pub chunks: u64,
    /// Rows inserted into the ghost table
    pub rows: u64,
}

/// Copy worker
pub struct RowCopier {
    ctx: Arc<MigrationContext>,
    applier: Arc<dyn Applier>,
}

impl std::fmt::Debug for RowCopier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCopier").finish_non_exhaustive()
    }
}

impl RowCopier {
    /// Create a copier writing through `applier`
    pub fn new(ctx: Arc<MigrationContext>, applier: Arc<dyn Applier>) -> Self {
        Self { ctx, applier }
    }

    /// Copy every chunk, then mark the copy complete
    ///
    /// # Errors
    /// Fatal collaborator errors, retry exhaustion, a regressing chunk
    /// boundary, or shutdown while waiting.
    pub async fn run(self) -> Result<CopyStats, MigrationError> {
        let ctx = self.ctx.as_ref();
        let applier = self.applier.as_ref();
        let schema = ctx
            .schema()
            .ok_or_else(|| MigrationError::Inspection("schema not inspected".to_string()))?;
        let database = ctx.database();
        let names = ctx.names();
        let shutdown = ctx.shutdown();
        let retry_interval = ctx.settings().timing.retry_interval();

        let mut chunks = ChunkIterator::new(ctx.migration_range());
        let mut stats = CopyStats::default();

        if chunks.is_exhausted() {
            tracing::info!(table = %names.original, "table is empty, nothing to copy");
        } else {
            ctx.with_timeline(|t| t.row_copy_started_at = Some(Utc::now()));
            tracing::info!(
                table = %names.original,
                key = %schema.migration_key,
                range = ?ctx.migration_range().map(|r| r.to_string()),
                "row copy started"
            );
        }

        while let Some(request) = chunks.pending() {
            if !wait_while_throttled(ctx, shutdown).await {
                return Err(MigrationError::Cancelled { phase: Phase::Copy });
            }

            let chunk_size = ctx.chunk_size();
            let after = request.after.as_ref();
            let upper = &request.upper;
            let bounds = retry_transient(Phase::Copy, MAX_RETRIES, retry_interval, shutdown, move || {
                applier.next_chunk_bounds(
                    database,
                    &names.original,
                    &schema.migration_key,
                    after,
                    upper,
                    chunk_size,
                )
            })
            .await?;

            let Some(chunk) = chunks.advance(bounds)? else {
                break;
            };

            let range = &chunk;
            let rows = retry_transient(Phase::Copy, MAX_RETRIES, retry_interval, shutdown, move || {
                applier.copy_chunk(
                    database,
                    &names.original,
                    &names.ghost,
                    &schema.shared_columns,
                    &schema.migration_key,
                    range,
                )
            })
            .await?;

            ctx.add_rows_copied(rows);
            let iteration = ctx.complete_iteration(chunk.clone());
            ctx.mark_point_of_interest();
            stats.chunks += 1;
            stats.rows += rows;
            tracing::debug!(iteration, chunk = %chunk, rows, "chunk copied");
        }

        ctx.set_row_copy_complete();
        ctx.with_timeline(|t| t.row_copy_ended_at = Some(Utc::now()));
        tracing::info!(chunks = stats.chunks, rows = stats.rows, "row copy complete");
        Ok(stats)
    }
}
