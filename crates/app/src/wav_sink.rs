use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::Context;
use hound::{SampleFormat, WavSpec, WavWriter};
use pcmcap_audio::{ChunkSink, NegotiatedParams};

/// Delivery sink that appends captured S16LE chunks to a RIFF/WAV file.
///
/// The header is built from the session's advertised parameters, the fixed
/// capability triple, rather than any negotiated fallback.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: &Path, params: NegotiatedParams) -> anyhow::Result<Self> {
        let spec = WavSpec {
            channels: params.channels,
            sample_rate: params.sample_rate,
            bits_per_sample: params.bits_per_sample,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)
            .with_context(|| format!("cannot create WAV file {}", path.display()))?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    /// Write the header's final sizes. Also runs on drop, but dropping swallows
    /// the error.
    pub fn finalize(mut self) -> anyhow::Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("failed to finalize WAV file")?;
        }
        Ok(())
    }
}

impl ChunkSink for WavSink {
    fn deliver(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            anyhow::bail!("WAV writer already finalized");
        };
        for sample in chunk.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("{e:#}");
        }
    }
}
