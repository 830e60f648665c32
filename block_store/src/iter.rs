//! Iterator composition over block records.
//!
//! [`TraceIterator`] is the shared contract between the read path and
//! compaction: an async stream of `(trace id, object bytes)` in ascending id
//! order. [`BlockIterator`] walks one block's pages; [`PrefetchIterator`]
//! overlaps a slow iterator's I/O with its consumer via a bounded channel.

use std::{collections::VecDeque, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{BlockId, TraceId};
use object_store::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{index::BlockIndex, page, DynObjectStore, Error, Result};

/// An ordered async stream of block records.
#[async_trait]
pub trait TraceIterator: Send + fmt::Debug {
    /// The next record, or `None` at end of stream.
    async fn next(&mut self) -> Result<Option<(TraceId, Bytes)>>;

    /// Release held resources. Idempotent; [`TraceIterator::next`] after
    /// close returns [`Error::IteratorClosed`].
    async fn close(&mut self);
}

/// Sequential iterator over all records of one block, fetching one page at a
/// time.
#[derive(Debug)]
pub struct BlockIterator {
    store: Arc<DynObjectStore>,
    data_path: Path,
    block_id: BlockId,
    index: Arc<BlockIndex>,
    next_page: usize,
    current: VecDeque<(TraceId, Bytes)>,
    closed: bool,
}

impl BlockIterator {
    pub(crate) fn new(
        store: Arc<DynObjectStore>,
        data_path: Path,
        block_id: BlockId,
        index: Arc<BlockIndex>,
    ) -> Self {
        Self {
            store,
            data_path,
            block_id,
            index,
            next_page: 0,
            current: VecDeque::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl TraceIterator for BlockIterator {
    async fn next(&mut self) -> Result<Option<(TraceId, Bytes)>> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        loop {
            if let Some(record) = self.current.pop_front() {
                return Ok(Some(record));
            }
            let Some(entry) = self.index.entries().get(self.next_page).copied() else {
                return Ok(None);
            };
            self.next_page += 1;

            let start = entry.offset as usize;
            let raw = self
                .store
                .get_range(&self.data_path, start..start + entry.length as usize)
                .await?;
            self.current = page::decode_page(&raw, self.block_id)?.into();
        }
    }

    async fn close(&mut self) {
        self.current.clear();
        self.closed = true;
    }
}

/// Wraps a slower iterator with a producer task and a bounded channel so the
/// consumer overlaps its own work with the next page fetch.
pub struct PrefetchIterator {
    rx: mpsc::Receiver<Result<(TraceId, Bytes)>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
    done: bool,
}

impl fmt::Debug for PrefetchIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchIterator")
            .field("closed", &self.closed)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl PrefetchIterator {
    /// Start prefetching from `inner` with an in-flight budget of `buffer`
    /// records.
    pub fn new(mut inner: Box<dyn TraceIterator>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = producer_cancel.cancelled() => break,
                    item = inner.next() => item,
                };
                match item {
                    Ok(Some(record)) => {
                        let send = tokio::select! {
                            _ = producer_cancel.cancelled() => Err(()),
                            sent = tx.send(Ok(record)) => sent.map_err(|_| ()),
                        };
                        if send.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            inner.close().await;
        });

        Self {
            rx,
            cancel,
            task: Some(task),
            closed: false,
            done: false,
        }
    }
}

#[async_trait]
impl TraceIterator for PrefetchIterator {
    async fn next(&mut self) -> Result<Option<(TraceId, Bytes)>> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        // Drain whatever the producer buffered so its memory is released.
        while self.rx.try_recv().is_ok() {}
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PrefetchIterator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StaticIterator {
        records: VecDeque<(TraceId, Bytes)>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl TraceIterator for StaticIterator {
        async fn next(&mut self) -> Result<Option<(TraceId, Bytes)>> {
            Ok(self.records.pop_front())
        }

        async fn close(&mut self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn record(n: u8) -> (TraceId, Bytes) {
        (TraceId::from_bytes([n; 16]), Bytes::from(vec![n]))
    }

    #[tokio::test]
    async fn prefetch_preserves_order_and_terminates() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inner = StaticIterator {
            records: (1..=5).map(record).collect(),
            closed: Arc::clone(&closed),
        };

        let mut it = PrefetchIterator::new(Box::new(inner), 2);
        for n in 1..=5 {
            let (id, bytes) = it.next().await.unwrap().unwrap();
            assert_eq!(id, TraceId::from_bytes([n; 16]));
            assert_eq!(bytes[0], n);
        }
        assert!(it.next().await.unwrap().is_none());
        // End of stream is sticky.
        assert!(it.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_inner() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inner = StaticIterator {
            records: (1..=100).map(|n| record(n as u8)).collect(),
            closed: Arc::clone(&closed),
        };

        let mut it = PrefetchIterator::new(Box::new(inner), 2);
        it.next().await.unwrap().unwrap();

        it.close().await;
        it.close().await;
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(it.next().await, Err(Error::IteratorClosed)));
    }
}
