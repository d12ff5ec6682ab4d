use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcmcap_foundation::{AudioError, Clock, SessionState, StateManager};

use crate::chunker::{Rechunker, CHUNK_BYTES};
use crate::device::CapturePcm;
use crate::recovery::{run_recovery, RecoveryOutcome};
use crate::sink::SharedSink;

/// Per-iteration cap on frames pulled from the device.
pub const FRAME_QUOTA: usize = 2048;
/// Bound on one device-readiness wait.
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Backoff when the device reports nothing available.
pub(crate) const IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Counters published by the capture worker.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub bytes_captured: AtomicU64,
    pub chunks_delivered: AtomicU64,
    pub device_faults: AtomicU64,
    pub recoveries: AtomicU64,
    pub reopens: AtomicU64,
    pub commit_mismatches: AtomicU64,
    pub stream_restarts: AtomicU64,
}

/// Handle to the dedicated capture thread.
pub struct CaptureThread<D: CapturePcm + 'static> {
    handle: JoinHandle<WorkerExit<D>>,
}

/// What the worker leaves behind when it returns.
pub(crate) struct WorkerExit<D> {
    /// The open device, handed back for reuse by a later start. `None` after a
    /// fatal loop exit.
    pub device: Option<D>,
}

impl<D: CapturePcm + 'static> CaptureThread<D> {
    pub(crate) fn spawn<F>(
        device: D,
        reopen: F,
        sink: SharedSink,
        running: Arc<AtomicBool>,
        state: Arc<StateManager>,
        stats: Arc<CaptureStats>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AudioError>
    where
        F: FnMut() -> Result<D, AudioError> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let worker = CaptureWorker {
                    device,
                    reopen,
                    sink,
                    running,
                    state,
                    stats,
                    clock,
                    rechunker: Rechunker::new(),
                    staging: Vec::new(),
                };
                worker.run()
            })
            .map_err(|e| AudioError::Fatal(format!("failed to spawn capture thread: {e}")))?;
        Ok(Self { handle })
    }

    /// Block until the worker returns. The worker observes a cleared capturing
    /// flag within one wait-timeout cycle, which bounds this in practice.
    pub(crate) fn join(self) -> WorkerExit<D> {
        self.handle.join().unwrap_or_else(|_| {
            tracing::error!("capture thread panicked");
            WorkerExit { device: None }
        })
    }
}

struct CaptureWorker<D, F> {
    device: D,
    reopen: F,
    sink: SharedSink,
    running: Arc<AtomicBool>,
    state: Arc<StateManager>,
    stats: Arc<CaptureStats>,
    clock: Arc<dyn Clock>,
    rechunker: Rechunker,
    staging: Vec<u8>,
}

impl<D, F> CaptureWorker<D, F>
where
    D: CapturePcm,
    F: FnMut() -> Result<D, AudioError>,
{
    fn run(mut self) -> WorkerExit<D> {
        tracing::info!("capture loop started");

        let fatal = loop {
            if !self.running.load(Ordering::SeqCst) {
                break None;
            }

            if let Err(e) = self.device.wait_ready(WAIT_TIMEOUT) {
                tracing::warn!("device wait error: {e}");
                continue;
            }

            let avail = match self.device.frames_available() {
                Ok(n) => n,
                Err(fault) => {
                    self.stats.device_faults.fetch_add(1, Ordering::Relaxed);
                    match run_recovery(&mut self.device, &mut self.reopen, &fault) {
                        RecoveryOutcome::Recovered => {
                            self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        RecoveryOutcome::Reopened => {
                            self.stats.reopens.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        RecoveryOutcome::Aborted => break Some(fault),
                    }
                }
            };

            if avail == 0 {
                if !self.device.is_running() {
                    tracing::warn!("capture stream not running, restarting");
                    self.stats.stream_restarts.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.device.restart() {
                        tracing::warn!("stream restart failed: {e}");
                    }
                }
                self.clock.sleep(IDLE_BACKOFF);
                continue;
            }

            let request = avail.min(FRAME_QUOTA);
            self.consume(request);
        };

        // Terminal flush: whatever is left in the accumulator goes out short.
        {
            let mut sink = self.sink.lock();
            self.rechunker.flush_partial(sink.as_mut());
        }

        match fatal {
            Some(fault) => {
                let reason = fault.to_string();
                tracing::error!("capture loop terminated by unrecoverable fault: {reason}");
                if let Err(e) = self.state.transition(SessionState::Faulted { reason }) {
                    tracing::warn!("{e}");
                }
                WorkerExit { device: None }
            }
            None => {
                tracing::info!("capture loop stopped");
                WorkerExit {
                    device: Some(self.device),
                }
            }
        }
    }

    /// One acquire/commit cycle: expose the mapped region, spill it into the
    /// re-chunker while the view is live, commit, account.
    fn consume(&mut self, request: usize) {
        let rechunker = &mut self.rechunker;
        let staging = &mut self.staging;
        let sink = &self.sink;

        let committed = match self.device.acquire(request, &mut |samples| {
            if samples.is_empty() {
                return;
            }
            staging.clear();
            staging.reserve(samples.len() * 2);
            for &s in samples {
                staging.extend_from_slice(&s.to_le_bytes());
            }
            let mut guard = sink.lock();
            rechunker.ingest(staging, guard.as_mut());
        }) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("buffer acquire failed: {e}");
                return;
            }
        };

        if committed != request {
            self.stats.commit_mismatches.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("commit mismatch: requested {request} frames, committed {committed}");
        }

        let bytes = self.staging.len() as u64;
        if bytes > 0 {
            let total = self.stats.bytes_captured.fetch_add(bytes, Ordering::Relaxed) + bytes;
            self.stats
                .chunks_delivered
                .store(total / CHUNK_BYTES as u64, Ordering::Relaxed);
            self.staging.clear();
        }
    }
}
