use pcmcap_foundation::AudioError;

use crate::device::CapturePcm;

/// What the capture loop should do after a device fault was handled.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The existing handle recovered in place.
    Recovered,
    /// The handle was replaced by a freshly negotiated one.
    Reopened,
    /// Neither in-place recovery nor reopening worked; the loop must terminate.
    Aborted,
}

fn classify(fault: &AudioError) -> &'static str {
    match fault.device_errno() {
        Some(e) if e == -libc::EPIPE => "buffer overrun",
        Some(e) if e == -libc::ESTRPIPE => "stream suspended",
        _ => "device fault",
    }
}

/// Handle a fault from the availability query: in-place recovery first, then a
/// full reopen through the negotiator, then give up. None of this reaches the
/// consumer; a successful pass shows up only as a discontinuity in the byte
/// stream.
pub fn run_recovery<D, F>(device: &mut D, reopen: &mut F, fault: &AudioError) -> RecoveryOutcome
where
    D: CapturePcm,
    F: FnMut() -> Result<D, AudioError>,
{
    match device.try_recover(fault) {
        Ok(()) => {
            tracing::info!("recovered in place from {}: {fault}", classify(fault));
            RecoveryOutcome::Recovered
        }
        Err(recover_err) => {
            tracing::warn!("in-place recovery failed ({recover_err}); reopening device");
            match reopen() {
                Ok(fresh) => {
                    // Replacing the handle closes the faulted one.
                    *device = fresh;
                    RecoveryOutcome::Reopened
                }
                Err(open_err) => {
                    tracing::error!("device reopen failed: {open_err}");
                    RecoveryOutcome::Aborted
                }
            }
        }
    }
}
