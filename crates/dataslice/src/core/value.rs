//! Row stream representation shared by readers, writers and rewrite stages.
//!
//! A [`RowStream`] is a header plus a bounded channel of row batches. The
//! producer runs in its own task and suspends when the channel is full, so a
//! slow writer applies backpressure all the way to the source query. Streams
//! are single-pass: once a batch is consumed it is gone.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, SliceError};

/// Literal representing SQL NULL in text encodings (COPY text and CSV files).
pub const NULL_MARKER: &str = "\\N";

/// One row: positional textual values, `None` for null.
pub type Row = Vec<Option<String>>;

/// A chunk of rows moved through the channel at once.
pub type RowBatch = Vec<Row>;

/// Default number of batches buffered between producer and consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Decode a text cell, mapping the null marker to `None`.
pub fn decode_cell(cell: &str) -> Option<String> {
    if cell == NULL_MARKER {
        None
    } else {
        Some(cell.to_string())
    }
}

/// Encode a value as a text cell, mapping `None` to the null marker.
pub fn encode_cell(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(NULL_MARKER)
}

/// Producer half of a [`RowStream`].
#[derive(Debug, Clone)]
pub struct RowSender {
    tx: mpsc::Sender<Result<RowBatch>>,
}

impl RowSender {
    /// Send a batch, waiting for channel capacity.
    pub async fn send(&self, batch: RowBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(batch))
            .await
            .map_err(|_| SliceError::StreamClosed)
    }

    /// Send a batch from a blocking thread.
    pub fn blocking_send(&self, batch: RowBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(Ok(batch))
            .map_err(|_| SliceError::StreamClosed)
    }

    /// Terminate the stream with an error. The consumer sees it as its next item.
    pub async fn fail(&self, err: SliceError) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Blocking variant of [`fail`](Self::fail).
    pub fn blocking_fail(&self, err: SliceError) {
        let _ = self.tx.blocking_send(Err(err));
    }
}

/// Synchronous per-batch transformation applied by [`RowStream::pipe`].
pub trait BatchStage: Send + 'static {
    fn process(&mut self, batch: RowBatch) -> Result<RowBatch>;
}

/// Finite, forward-only sequence of row batches with a fixed header.
#[derive(Debug)]
pub struct RowStream {
    header: Vec<String>,
    rx: mpsc::Receiver<Result<RowBatch>>,
}

impl RowStream {
    /// Create a bounded stream and its producer handle.
    pub fn channel(header: Vec<String>, capacity: usize) -> (RowSender, RowStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (RowSender { tx }, RowStream { header, rx })
    }

    /// Stream over rows already in memory, delivered as a single batch.
    pub fn from_rows(header: Vec<String>, rows: Vec<Row>) -> RowStream {
        let (tx, rx) = mpsc::channel(1);
        if !rows.is_empty() {
            // Capacity 1 on a fresh channel: cannot fail.
            let _ = tx.try_send(Ok(rows));
        }
        RowStream { header, rx }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|c| c == name)
    }

    /// Next batch, `None` once the producer has finished.
    pub async fn next_batch(&mut self) -> Option<Result<RowBatch>> {
        self.rx.recv().await
    }

    /// Drain the stream into memory. Intended for small streams and tests.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch().await {
            rows.extend(batch?);
        }
        Ok(rows)
    }

    /// Run `stage` over every batch in a separate task.
    ///
    /// Returns the rewritten stream and a handle yielding the stage back once
    /// the input is exhausted. Input errors are forwarded downstream.
    pub fn pipe<S: BatchStage>(
        mut self,
        capacity: usize,
        mut stage: S,
    ) -> (RowStream, JoinHandle<Result<S>>) {
        let (tx, out) = RowStream::channel(self.header.clone(), capacity);
        let handle = tokio::spawn(async move {
            while let Some(batch) = self.next_batch().await {
                let processed = match batch.and_then(|b| stage.process(b)) {
                    Ok(b) => b,
                    Err(e) => {
                        let message = e.to_string();
                        tx.fail(e).await;
                        return Err(SliceError::Validation(format!(
                            "rewrite stage stopped: {message}"
                        )));
                    }
                };
                tx.send(processed).await?;
            }
            Ok(stage)
        });
        (out, handle)
    }
}
