use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use pcmcap_foundation::{
    AudioError, CaptureConfig, Clock, RealClock, SessionState, StateManager,
};

use crate::capture::{CaptureStats, CaptureThread};
use crate::device::{open_capture_device, AlsaDevice, CapturePcm, NegotiatedParams};
use crate::sink::{ChunkSink, SharedSink};
use crate::spool::LegacySpool;

type OpenerFn<D> = Box<dyn FnMut() -> Result<D, AudioError> + Send>;
/// Shared between the session (initial open) and the worker (mid-session
/// reopen after a failed in-place recovery).
type SharedOpener<D> = Arc<Mutex<OpenerFn<D>>>;

/// The process-wide capture session: one device, one worker, one sink.
///
/// Control methods take `&mut self`, so callers that share a session across
/// threads wrap it in their own lock; that same lock serializes
/// start/stop/release, which the engine requires. The capturing flag is the
/// only synchronization the worker itself polls.
pub struct CaptureSession<D: CapturePcm + 'static = AlsaDevice> {
    capturing: Arc<AtomicBool>,
    state: Arc<StateManager>,
    stats: Arc<CaptureStats>,
    clock: Arc<dyn Clock>,
    open_device: SharedOpener<D>,
    device: Option<D>,
    params: Option<NegotiatedParams>,
    worker: Option<CaptureThread<D>>,
    sink: Option<SharedSink>,
    spool: Option<LegacySpool>,
}

impl CaptureSession<AlsaDevice> {
    /// Session wired to the ALSA negotiator.
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_device_opener(move || open_capture_device(&config))
    }
}

impl<D: CapturePcm + 'static> CaptureSession<D> {
    /// Build a session around a custom device opener; the opener runs for the
    /// initial open and again whenever the recovery policy reopens mid-session.
    pub fn with_device_opener<F>(opener: F) -> Self
    where
        F: FnMut() -> Result<D, AudioError> + Send + 'static,
    {
        let opener: OpenerFn<D> = Box::new(opener);
        Self {
            capturing: Arc::new(AtomicBool::new(false)),
            state: Arc::new(StateManager::new()),
            stats: Arc::new(CaptureStats::default()),
            clock: Arc::new(RealClock::new()),
            open_device: Arc::new(Mutex::new(opener)),
            device: None,
            params: None,
            worker: None,
            sink: None,
            spool: None,
        }
    }

    /// Substitute the loop's clock (virtual time in tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Begin capturing into `sink`.
    ///
    /// Idempotent while capturing: a second start returns without touching the
    /// live session. Registers the sink (dropping any previous one), opens a
    /// device only if none is already held from an earlier stop, and spawns the
    /// worker. Every error path leaves the capturing flag cleared and no worker
    /// running.
    pub fn start(&mut self, sink: Box<dyn ChunkSink>, audio_mode: bool) -> Result<(), AudioError> {
        if self.capturing.swap(true, Ordering::SeqCst) {
            tracing::debug!("start ignored: already capturing");
            return Ok(());
        }

        // The previous registration is dropped here regardless of what follows.
        self.sink = Some(Arc::new(Mutex::new(sink)));

        if !audio_mode {
            self.capturing.store(false, Ordering::SeqCst);
            return Err(AudioError::NotImplemented("video capture"));
        }

        if self.device.is_none() {
            let opened = {
                let mut open = self.open_device.lock();
                (*open)()
            };
            match opened {
                Ok(device) => {
                    self.params = Some(device.params());
                    self.device = Some(device);
                }
                Err(e) => {
                    self.capturing.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        if self.spool.is_none() {
            self.spool = Some(LegacySpool::new());
        }

        let Some(device) = self.device.take() else {
            self.capturing.store(false, Ordering::SeqCst);
            return Err(AudioError::Fatal("device missing after open".into()));
        };
        let Some(sink) = self.sink.as_ref().map(Arc::clone) else {
            self.capturing.store(false, Ordering::SeqCst);
            return Err(AudioError::Fatal("sink missing after registration".into()));
        };

        if let Err(e) = self.state.transition(SessionState::Capturing) {
            self.capturing.store(false, Ordering::SeqCst);
            self.device = Some(device);
            return Err(AudioError::Fatal(e.to_string()));
        }

        let opener = Arc::clone(&self.open_device);
        let reopen = move || {
            let mut open = opener.lock();
            (*open)()
        };

        match CaptureThread::spawn(
            device,
            reopen,
            sink,
            Arc::clone(&self.capturing),
            Arc::clone(&self.state),
            Arc::clone(&self.stats),
            Arc::clone(&self.clock),
        ) {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                // The device traveled into the failed spawn and is gone with it.
                self.capturing.store(false, Ordering::SeqCst);
                let _ = self.state.transition(SessionState::Stopping);
                let _ = self.state.transition(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Halt the worker, keeping the device open for a later start.
    ///
    /// Blocks until the worker has joined; the worker observes the cleared flag
    /// within one wait-timeout cycle. The sink registration survives a stop.
    pub fn stop(&mut self) {
        self.capturing.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            if let Some(spool) = &mut self.spool {
                spool.reset();
            }
            return;
        };

        if matches!(
            self.state.current(),
            SessionState::Capturing | SessionState::Faulted { .. }
        ) {
            let _ = self.state.transition(SessionState::Stopping);
        }

        let exit = worker.join();
        self.device = exit.device;
        if let Some(device) = &self.device {
            self.params = Some(device.params());
        }
        if let Some(spool) = &mut self.spool {
            spool.reset();
        }
        let _ = self.state.transition(SessionState::Idle);
    }

    /// Tear the session down: stop the worker if one is live, drop pending
    /// frames, close the device, reallocate the legacy spool backing buffer,
    /// and drop the sink. Safe to call from Idle; a later start reopens a
    /// device from scratch.
    pub fn release(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
        if let Some(mut device) = self.device.take() {
            device.discard_pending();
            // Dropping the handle closes the device.
        }
        self.params = None;
        if self.spool.is_some() {
            self.spool = Some(LegacySpool::new());
        }
        self.sink = None;
    }

    /// The fixed capability triple the legacy control surface reports,
    /// independent of any negotiated fallback. See
    /// [`CaptureSession::negotiated_params`] for the real values.
    pub fn advertised_params(&self) -> NegotiatedParams {
        NegotiatedParams {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    /// What the device actually negotiated, once one has been opened. Reflects
    /// the most recent open observed on this thread; a mid-session reopen shows
    /// up here after the next stop.
    pub fn negotiated_params(&self) -> Option<NegotiatedParams> {
        self.params
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Channel of state transitions, including the worker's own move to
    /// `Faulted` when recovery is exhausted.
    pub fn state_changes(&self) -> crossbeam_channel::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::CHUNK_BYTES;
    use crate::testing::{ScriptedPcm, Step};
    use pcmcap_foundation::TestClock;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    type Chunks = Arc<Mutex<Vec<Vec<u8>>>>;

    fn chunk_sink() -> (Chunks, Box<dyn ChunkSink>) {
        let chunks: Chunks = Arc::new(Mutex::new(Vec::new()));
        let sink_chunks = Arc::clone(&chunks);
        let sink = move |chunk: &[u8]| -> anyhow::Result<()> {
            sink_chunks.lock().push(chunk.to_vec());
            Ok(())
        };
        (chunks, Box::new(sink))
    }

    fn counting_session(
        scripts: Vec<Vec<Step>>,
    ) -> (Arc<AtomicUsize>, CaptureSession<ScriptedPcm>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let opener_opens = Arc::clone(&opens);
        let scripts = Arc::new(Mutex::new(scripts));
        let session = CaptureSession::with_device_opener(move || {
            let n = opener_opens.fetch_add(1, Ordering::SeqCst);
            let mut scripts = scripts.lock();
            let script = if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            };
            Ok(ScriptedPcm::new(n as u32 + 1, script))
        })
        .with_clock(Arc::new(TestClock::new()));
        (opens, session)
    }

    fn wait_for<P: Fn() -> bool>(pred: P, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_full_chunks_then_a_final_partial() {
        // 250 + 250 + 150 frames at 4 bytes/frame = 2600 bytes: two full
        // chunks while running, a 552-byte tail at stop.
        let (opens, mut session) = counting_session(vec![vec![
            Step::Deliver(250),
            Step::Deliver(250),
            Step::Deliver(150),
        ]]);
        let (chunks, sink) = chunk_sink();

        session.start(sink, true).unwrap();
        wait_for(|| chunks.lock().len() >= 2, "two full chunks");
        session.stop();

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_BYTES);
        assert_eq!(chunks[1].len(), CHUNK_BYTES);
        assert_eq!(chunks[2].len(), 552);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(
            session.stats().bytes_captured.load(Ordering::Relaxed),
            2600
        );
    }

    #[test]
    fn start_is_idempotent_while_capturing() {
        let (opens, mut session) = counting_session(vec![Vec::new()]);
        let (first_chunks, first_sink) = chunk_sink();
        let (second_chunks, second_sink) = chunk_sink();

        session.start(first_sink, true).unwrap();
        assert!(session.is_capturing());
        // Second start: no second worker, no second device, sink untouched.
        session.start(second_sink, true).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Capturing);

        session.stop();
        assert!(first_chunks.lock().is_empty());
        assert!(second_chunks.lock().is_empty());
    }

    #[test]
    fn stop_then_start_reuses_the_open_device() {
        let (opens, mut session) = counting_session(vec![vec![Step::Deliver(100)]]);
        let (first_chunks, first_sink) = chunk_sink();

        session.start(first_sink, true).unwrap();
        // 100 frames = 400 bytes: less than a chunk, so it only surfaces as the
        // terminal flush when the session stops.
        let stats = session.stats();
        wait_for(
            || stats.bytes_captured.load(Ordering::Relaxed) >= 400,
            "first session bytes",
        );
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        // The 400-byte partial arrived in the old sink at stop time.
        assert_eq!(first_chunks.lock().last().unwrap().len(), 400);

        let (second_chunks, second_sink) = chunk_sink();
        session.start(second_sink, true).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1, "device must be reused");
        session.stop();

        // Nothing from the first session leaks into the new sink.
        assert_eq!(first_chunks.lock().len(), 1);
        assert!(second_chunks.lock().is_empty());
    }

    #[test]
    fn disabled_audio_mode_aborts_without_leaving_the_flag_set() {
        let (opens, mut session) = counting_session(vec![]);
        let (_chunks, sink) = chunk_sink();

        let err = session.start(sink, false).unwrap_err();
        assert!(matches!(err, AudioError::NotImplemented(_)));
        assert!(!session.is_capturing());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(opens.load(Ordering::SeqCst), 0);

        // The session is still usable afterwards.
        let (_chunks2, sink2) = chunk_sink();
        session.start(sink2, true).unwrap();
        session.stop();
    }

    #[test]
    fn failed_open_reports_and_resets() {
        let mut session: CaptureSession<ScriptedPcm> =
            CaptureSession::with_device_opener(|| Err(AudioError::DeviceNotFound { name: None }));
        let (_chunks, sink) = chunk_sink();
        let err = session.start(sink, true).unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound { .. }));
        assert!(!session.is_capturing());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn release_from_idle_is_harmless_and_restartable() {
        let (_opens, mut session) = counting_session(vec![Vec::new(), Vec::new()]);
        session.release();
        assert_eq!(session.state(), SessionState::Idle);

        let (_chunks, sink) = chunk_sink();
        session.start(sink, true).unwrap();
        session.stop();
        session.release();
        assert!(session.negotiated_params().is_none());

        // A start after release opens a fresh device.
        let (_chunks2, sink2) = chunk_sink();
        session.start(sink2, true).unwrap();
        session.stop();
    }

    #[test]
    fn exhausted_recovery_faults_the_session_observably() {
        let opens = Arc::new(AtomicUsize::new(0));
        let opener_opens = Arc::clone(&opens);
        let mut session = CaptureSession::with_device_opener(move || {
            if opener_opens.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ScriptedPcm::new(
                    1,
                    vec![Step::Fault { recover_ok: false }],
                ))
            } else {
                // The mid-session reopen fails too: recovery is exhausted.
                Err(AudioError::DeviceNotFound { name: None })
            }
        })
        .with_clock(Arc::new(TestClock::new()));

        let (_chunks, sink) = chunk_sink();
        let states = session.state_changes();
        session.start(sink, true).unwrap();

        wait_for(
            || matches!(session.state(), SessionState::Faulted { .. }),
            "worker fault",
        );
        // The flag is left as the worker found it; the state machine is what
        // makes the dead loop visible.
        assert!(session.is_capturing());
        assert!(states
            .try_iter()
            .any(|s| matches!(s, SessionState::Faulted { .. })));

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        // The faulted device was closed by the worker; a new start reopens.
        let (_chunks2, sink2) = chunk_sink();
        let err = session.start(sink2, true).unwrap_err();
        assert!(matches!(err, AudioError::DeviceNotFound { .. }));
    }

    #[test]
    fn release_discards_pending_frames_before_close() {
        let discards = Arc::new(AtomicUsize::new(0));
        let opener_discards = Arc::clone(&discards);
        let mut session = CaptureSession::with_device_opener(move || {
            Ok(ScriptedPcm::new(1, Vec::new())
                .with_discard_counter(Arc::clone(&opener_discards)))
        })
        .with_clock(Arc::new(TestClock::new()));

        let (_chunks, sink) = chunk_sink();
        session.start(sink, true).unwrap();
        session.stop();
        session.release();

        assert_eq!(discards.load(Ordering::SeqCst), 1);
        assert!(session.negotiated_params().is_none());
    }
}
