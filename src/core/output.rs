//! Output multiplexer - live fan-out of a running task's console output
//!
//! One multiplexer is created per running task. Readers see output from
//! the moment they attach; nothing before that is replayed.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// Largest chunk handed to a reader
pub const CHUNK_SIZE: usize = 4096;

/// Producer side, owned by the queue for the lifetime of one task
#[derive(Clone)]
pub struct OutputMux {
    tx: Arc<Mutex<Option<broadcast::Sender<Arc<[u8]>>>>>,
}

impl OutputMux {
    /// `capacity` is counted in chunks
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Publish bytes to every attached reader. Never blocks.
    pub fn publish(&self, bytes: &[u8]) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };

        for chunk in bytes.chunks(CHUNK_SIZE) {
            // Err only means nobody is attached right now
            let _ = tx.send(Arc::from(chunk));
        }
    }

    /// Register a reader that resumes from "now"
    pub fn attach(&self) -> OutputReader {
        OutputReader {
            rx: self.tx.lock().as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Mark the stream finished; readers drain what they have, then see end-of-stream
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn reader_count(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Consumer side. Dropping it detaches.
pub struct OutputReader {
    rx: Option<broadcast::Receiver<Arc<[u8]>>>,
}

impl OutputReader {
    /// Next chunk, or `None` once the task is done and everything was delivered
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(chunk) => return Some(chunk.to_vec()),
                Err(RecvError::Lagged(skipped)) => {
                    // Live tail: a slow reader just loses the oldest chunks
                    log::debug!("Output reader lagged, skipped {} chunks", skipped);
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Explicit early termination
    pub fn detach(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_sees_only_output_after_attach() {
        let mux = OutputMux::new(16);
        mux.publish(b"before");

        let mut reader = mux.attach();
        mux.publish(b"after");
        mux.close();

        assert_eq!(reader.read().await, Some(b"after".to_vec()));
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test]
    async fn test_two_readers_independent() {
        let mux = OutputMux::new(16);
        let mut first = mux.attach();
        mux.publish(b"one");
        let mut second = mux.attach();
        mux.publish(b"two");
        mux.close();

        assert_eq!(first.read().await, Some(b"one".to_vec()));
        assert_eq!(first.read().await, Some(b"two".to_vec()));
        assert_eq!(first.read().await, None);

        assert_eq!(second.read().await, Some(b"two".to_vec()));
        assert_eq!(second.read().await, None);
    }

    #[tokio::test]
    async fn test_detach_does_not_block_producer() {
        let mux = OutputMux::new(2);
        let reader = mux.attach();
        let mut other = mux.attach();
        assert_eq!(mux.reader_count(), 2);

        reader.detach();
        assert_eq!(mux.reader_count(), 1);

        mux.publish(b"still flowing");
        assert_eq!(other.read().await, Some(b"still flowing".to_vec()));
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let mux = OutputMux::new(16);
        let mut reader = mux.attach();
        mux.publish(&vec![b'x'; CHUNK_SIZE + 10]);
        mux.close();

        assert_eq!(reader.read().await.map(|c| c.len()), Some(CHUNK_SIZE));
        assert_eq!(reader.read().await.map(|c| c.len()), Some(10));
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test]
    async fn test_attach_after_close_is_end_of_stream() {
        let mux = OutputMux::new(4);
        mux.close();
        assert!(mux.is_closed());
        let mut reader = mux.attach();
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test]
    async fn test_slow_reader_skips_oldest() {
        let mux = OutputMux::new(2);
        let mut reader = mux.attach();
        for i in 0..5u8 {
            mux.publish(&[b'0' + i]);
        }
        mux.close();

        let mut seen = Vec::new();
        while let Some(chunk) = reader.read().await {
            seen.extend(chunk);
        }
        assert_eq!(seen, b"34".to_vec());
    }
}
