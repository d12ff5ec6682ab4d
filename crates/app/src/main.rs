mod keys;
mod wav_sink;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use pcmcap_audio::{enumerate_capture_devices, CaptureSession};
use pcmcap_foundation::{CaptureConfig, SessionState};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use wav_sink::WavSink;

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "pcmcap.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    std::mem::forget(guard);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging().map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;
    tracing::info!("starting pcmcap");

    let out_path: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "capture.wav".to_string())
        .into();

    for dev in enumerate_capture_devices() {
        tracing::info!("capture endpoint: {} ({})", dev.id, dev.description);
    }

    let config = CaptureConfig {
        device: std::env::var("PCMCAP_DEVICE").ok(),
        ..CaptureConfig::default()
    };
    let mut session = CaptureSession::new(config);

    // The WAV header follows the advertised capability triple, not the
    // negotiated fallback.
    let sink = WavSink::create(&out_path, session.advertised_params())
        .with_context(|| format!("cannot create {}", out_path.display()))?;

    session
        .start(Box::new(sink), true)
        .context("failed to start capture")?;
    if let Some(p) = session.negotiated_params() {
        tracing::info!("negotiated {} Hz, {} channel(s)", p.sample_rate, p.channels);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    tracing::info!(
        "recording to {} - press 'q' or Ctrl-C to stop",
        out_path.display()
    );

    let stats = session.stats();
    let mut last_report = Instant::now();
    loop {
        if interrupted.load(Ordering::SeqCst) || keys::is_key_pressed('q') {
            break;
        }
        if let SessionState::Faulted { reason } = session.state() {
            tracing::error!("capture worker faulted: {reason}");
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            tracing::info!(
                "captured {} chunks ({} bytes)",
                stats.chunks_delivered.load(Ordering::Relaxed),
                stats.bytes_captured.load(Ordering::Relaxed)
            );
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    session.stop();
    session.release();
    tracing::info!("recording finished: {}", out_path.display());
    Ok(())
}
