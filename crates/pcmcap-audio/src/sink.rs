use parking_lot::Mutex;
use std::sync::Arc;

/// Consumer of captured chunks.
///
/// Every delivery is exactly [`crate::chunker::CHUNK_BYTES`] long except the
/// terminal flush at session end, which carries whatever remained. An `Err`
/// return is logged by the engine and never retried; failure handling is the
/// sink's own business.
pub trait ChunkSink: Send {
    fn deliver(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
}

impl<F> ChunkSink for F
where
    F: FnMut(&[u8]) -> anyhow::Result<()> + Send,
{
    fn deliver(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self(chunk)
    }
}

/// Sink registration shared between the session and the capture worker.
///
/// The session holds the only long-lived reference; the worker locks it per
/// delivery. Replacing the registration drops the previous sink.
pub type SharedSink = Arc<Mutex<Box<dyn ChunkSink>>>;
