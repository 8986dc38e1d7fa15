//! Record cursor abstraction
//!
//! Record stores hand the pipeline a [`RecordCursor`], which yields
//! key-sorted batches until exhausted. [`CursorRecordSource`] wraps a
//! MongoDB driver cursor.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Cursor;
use tracing::debug;

use crate::error::Result;
use crate::model::TaskRecord;

/// Trait for streaming records in batches
#[async_trait]
pub trait RecordCursor: Send {
    /// Fetch the next batch, or `None` once the cursor is exhausted
    async fn next_batch(&mut self) -> Result<Option<Vec<TaskRecord>>>;

    /// Release server-side resources
    async fn close(&mut self) -> Result<()>;
}

/// Batching wrapper around a typed MongoDB cursor
pub struct CursorRecordSource {
    cursor: Option<Cursor<TaskRecord>>,
    batch_size: u32,
    total_fetched: u64,
}

impl CursorRecordSource {
    pub fn new(cursor: Cursor<TaskRecord>, batch_size: u32) -> Self {
        Self {
            cursor: Some(cursor),
            batch_size: batch_size.max(1),
            total_fetched: 0,
        }
    }
}

#[async_trait]
impl RecordCursor for CursorRecordSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<TaskRecord>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let mut batch = Vec::with_capacity(self.batch_size as usize);
        for _ in 0..self.batch_size {
            match cursor.try_next().await {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => break,
                Err(e) => {
                    self.cursor = None;
                    return Err(e.into());
                }
            }
        }

        if batch.is_empty() {
            debug!(total = self.total_fetched, "record cursor exhausted");
            self.cursor = None;
            return Ok(None);
        }

        self.total_fetched += batch.len() as u64;
        debug!(
            batch = batch.len(),
            total = self.total_fetched,
            "fetched record batch"
        );
        Ok(Some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        if self.cursor.take().is_some() {
            debug!(total = self.total_fetched, "closed record cursor");
        }
        Ok(())
    }
}
