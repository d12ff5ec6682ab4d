//! Scripted capture device for exercising the loop, recovery, and session
//! logic without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pcmcap_foundation::AudioError;

use crate::device::{CapturePcm, NegotiatedParams};

/// One scripted loop interaction, consumed per availability query.
pub(crate) enum Step {
    /// Report this many frames available; the acquire grants them fully.
    Deliver(usize),
    /// Report `avail` frames but commit fewer than requested.
    ShortCommit { avail: usize, committed: usize },
    /// Fail the availability query; `recover_ok` scripts the in-place recovery.
    Fault { recover_ok: bool },
    /// Report nothing available, with the given run-state.
    Starved { running: bool },
}

struct Inner {
    script: VecDeque<Step>,
    recover_ok: bool,
    running: bool,
    restarts: usize,
    short_commit: Option<usize>,
    next_sample: i16,
}

pub(crate) struct ScriptedPcm {
    id: u32,
    params: NegotiatedParams,
    inner: Mutex<Inner>,
    discard_counter: Option<Arc<AtomicUsize>>,
}

impl ScriptedPcm {
    pub(crate) fn new(id: u32, script: Vec<Step>) -> Self {
        Self {
            id,
            params: NegotiatedParams {
                sample_rate: 44_100,
                channels: 2,
                bits_per_sample: 16,
            },
            inner: Mutex::new(Inner {
                script: script.into(),
                recover_ok: false,
                running: true,
                restarts: 0,
                short_commit: None,
                next_sample: 0,
            }),
            discard_counter: None,
        }
    }

    /// Mirror `discard_pending` calls into an external counter, so tests can
    /// observe teardown after the handle itself is gone.
    pub(crate) fn with_discard_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.discard_counter = Some(counter);
        self
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_recover_ok(&self, ok: bool) {
        self.inner.lock().recover_ok = ok;
    }

    pub(crate) fn restarts(&self) -> usize {
        self.inner.lock().restarts
    }
}

impl CapturePcm for ScriptedPcm {
    fn wait_ready(&self, _timeout: Duration) -> Result<bool, AudioError> {
        Ok(true)
    }

    fn frames_available(&self) -> Result<usize, AudioError> {
        let mut inner = self.inner.lock();
        inner.short_commit = None;
        match inner.script.pop_front() {
            None => Ok(0),
            Some(Step::Deliver(frames)) => Ok(frames),
            Some(Step::ShortCommit { avail, committed }) => {
                inner.short_commit = Some(committed);
                Ok(avail)
            }
            Some(Step::Fault { recover_ok }) => {
                inner.recover_ok = recover_ok;
                Err(AudioError::Fatal("scripted device fault".into()))
            }
            Some(Step::Starved { running }) => {
                inner.running = running;
                Ok(0)
            }
        }
    }

    fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn restart(&mut self) -> Result<(), AudioError> {
        let mut inner = self.inner.lock();
        inner.restarts += 1;
        inner.running = true;
        Ok(())
    }

    fn try_recover(&mut self, _fault: &AudioError) -> Result<(), AudioError> {
        if self.inner.lock().recover_ok {
            Ok(())
        } else {
            Err(AudioError::Fatal("scripted recovery failure".into()))
        }
    }

    fn acquire(
        &mut self,
        frames: usize,
        consume: &mut dyn FnMut(&[i16]),
    ) -> Result<usize, AudioError> {
        let mut inner = self.inner.lock();
        let samples: Vec<i16> = (0..frames * self.params.channels as usize)
            .map(|_| {
                let s = inner.next_sample;
                inner.next_sample = inner.next_sample.wrapping_add(1);
                s
            })
            .collect();
        drop(inner);
        consume(&samples);
        let committed = self.inner.lock().short_commit.take().unwrap_or(frames);
        Ok(committed)
    }

    fn discard_pending(&mut self) {
        if let Some(counter) = &self.discard_counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params(&self) -> NegotiatedParams {
        self.params
    }
}
