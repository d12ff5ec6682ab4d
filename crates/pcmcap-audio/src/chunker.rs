use crate::sink::ChunkSink;

/// Bytes per delivered chunk.
pub const CHUNK_BYTES: usize = 1024;

/// Accumulates raw capture bytes and hands fixed-size chunks to the delivery
/// sink. Owned exclusively by the capture worker; the accumulator resets to
/// empty after every full delivery.
pub struct Rechunker {
    buf: [u8; CHUNK_BYTES],
    cursor: usize,
}

impl Default for Rechunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Rechunker {
    pub fn new() -> Self {
        Self {
            buf: [0; CHUNK_BYTES],
            cursor: 0,
        }
    }

    /// Fill level of the pending chunk.
    pub fn pending(&self) -> usize {
        self.cursor
    }

    /// Copy `data` into the accumulator, delivering a chunk every time it fills.
    /// One call may trigger zero, one, or several deliveries depending on the
    /// incoming size relative to the remaining capacity.
    pub fn ingest(&mut self, mut data: &[u8], sink: &mut dyn ChunkSink) {
        while !data.is_empty() {
            let take = data.len().min(CHUNK_BYTES - self.cursor);
            self.buf[self.cursor..self.cursor + take].copy_from_slice(&data[..take]);
            self.cursor += take;
            data = &data[take..];
            if self.cursor == CHUNK_BYTES {
                self.deliver(sink, CHUNK_BYTES);
            }
        }
    }

    /// Deliver whatever is left in the accumulator, if anything. Called once
    /// when the capture loop exits.
    pub fn flush_partial(&mut self, sink: &mut dyn ChunkSink) {
        if self.cursor > 0 {
            let len = self.cursor;
            self.deliver(sink, len);
        }
    }

    fn deliver(&mut self, sink: &mut dyn ChunkSink, len: usize) {
        // A failing sink is the sink's problem; the stream keeps flowing.
        if let Err(e) = sink.deliver(&self.buf[..len]) {
            tracing::warn!("chunk delivery failed: {e:#}");
        }
        self.cursor = 0;
    }
}
