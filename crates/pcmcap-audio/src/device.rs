use std::ffi::CStr;
use std::time::Duration;

use alsa::card;
use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, Frames, HwParams, State};
use alsa::{Direction, ValueOr, PCM};

use pcmcap_foundation::{AudioError, CaptureConfig};

use crate::capture::FRAME_QUOTA;

/// Hardware parameters fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl NegotiatedParams {
    /// Bytes per frame (one sample per channel).
    pub fn frame_stride(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// Loop-facing view of an open capture stream.
///
/// The capture loop and recovery policy are written against this trait; the ALSA
/// implementation is [`AlsaDevice`]. Keeping the seam here lets every loop-level
/// behavior run against a scripted device in tests.
pub trait CapturePcm: Send {
    /// Block until the device reports frames ready or the timeout elapses.
    /// `Ok(false)` means timeout.
    fn wait_ready(&self, timeout: Duration) -> Result<bool, AudioError>;

    /// Frames currently readable. A device fault surfaces as `Err` and is routed
    /// through the recovery policy.
    fn frames_available(&self) -> Result<usize, AudioError>;

    fn is_running(&self) -> bool;

    /// Kick a stopped stream back into the running state.
    fn restart(&mut self) -> Result<(), AudioError>;

    /// In-place recovery from `fault`, without reopening the device.
    fn try_recover(&mut self, fault: &AudioError) -> Result<(), AudioError>;

    /// Acquire up to `frames` from the device's mapped buffer, expose the
    /// interleaved samples to `consume` for the duration of the call only, then
    /// commit them. Returns the committed frame count, which may be less than
    /// requested.
    fn acquire(
        &mut self,
        frames: usize,
        consume: &mut dyn FnMut(&[i16]),
    ) -> Result<usize, AudioError>;

    /// Drop any frames still queued in the device buffer ahead of close.
    fn discard_pending(&mut self) {}

    fn params(&self) -> NegotiatedParams;
}

/// An open, negotiated, running ALSA capture stream.
pub struct AlsaDevice {
    pcm: PCM,
    name: String,
    params: NegotiatedParams,
}

impl AlsaDevice {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CapturePcm for AlsaDevice {
    fn wait_ready(&self, timeout: Duration) -> Result<bool, AudioError> {
        self.pcm
            .wait(Some(timeout.as_millis() as u32))
            .map_err(AudioError::alsa("snd_pcm_wait"))
    }

    fn frames_available(&self) -> Result<usize, AudioError> {
        let frames = self
            .pcm
            .avail()
            .map_err(AudioError::alsa("snd_pcm_avail"))?;
        Ok(frames.max(0) as usize)
    }

    fn is_running(&self) -> bool {
        matches!(self.pcm.state(), State::Running)
    }

    fn restart(&mut self) -> Result<(), AudioError> {
        self.pcm.start().map_err(AudioError::alsa("snd_pcm_start"))
    }

    fn try_recover(&mut self, fault: &AudioError) -> Result<(), AudioError> {
        let Some(errno) = fault.device_errno() else {
            return Err(AudioError::Fatal(format!(
                "fault has no device errno: {fault}"
            )));
        };
        self.pcm
            .recover(errno, true)
            .map_err(AudioError::alsa("snd_pcm_recover"))
    }

    fn acquire(
        &mut self,
        frames: usize,
        consume: &mut dyn FnMut(&[i16]),
    ) -> Result<usize, AudioError> {
        let channels = self.params.channels as usize;
        let io = self
            .pcm
            .io_i16()
            .map_err(AudioError::alsa("snd_pcm_io"))?;
        // The closure scope is the lifetime of the mapped view; commit happens on
        // return with however many frames were granted.
        io.mmap(frames, |buf| {
            consume(buf);
            buf.len() / channels
        })
        .map_err(AudioError::alsa("snd_pcm_mmap"))
    }

    fn discard_pending(&mut self) {
        if let Err(e) = self.pcm.drop() {
            tracing::warn!("snd_pcm_drop failed: {e}");
        }
    }

    fn params(&self) -> NegotiatedParams {
        self.params
    }
}

/// A capture-capable endpoint visible to the host.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub description: String,
    pub is_default: bool,
}

fn pcm_iface() -> &'static CStr {
    c"pcm"
}

/// First capture-capable hardware endpoint across all sound cards, or
/// `"default"` when none is found.
pub fn first_capture_device_name() -> String {
    for card in card::Iter::new() {
        let card = match card {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("sound card enumeration error: {e}");
                continue;
            }
        };
        if let Some(name) = first_capture_endpoint(&card) {
            return name;
        }
    }
    "default".to_string()
}

fn first_capture_endpoint(card: &card::Card) -> Option<String> {
    let hints = match HintIter::new(Some(card), pcm_iface()) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("cannot enumerate PCM endpoints on card {}: {e}", card.get_index());
            return None;
        }
    };
    for hint in hints {
        let Some(name) = hint.name else { continue };
        if !name.starts_with("hw:") {
            continue;
        }
        if matches!(hint.direction, Some(Direction::Playback)) {
            continue;
        }
        return Some(name);
    }
    None
}

/// All capture-capable endpoints, for logging and display.
pub fn enumerate_capture_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    let hints = match HintIter::new(None, pcm_iface()) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!("device enumeration failed: {e}");
            return devices;
        }
    };
    for hint in hints {
        let Some(id) = hint.name else { continue };
        if id == "null" {
            continue;
        }
        if matches!(hint.direction, Some(Direction::Playback)) {
            continue;
        }
        let description = hint
            .desc
            .map(|d| d.lines().next().unwrap_or_default().to_string())
            .unwrap_or_default();
        let is_default = id == "default";
        devices.push(DeviceInfo {
            id,
            description,
            is_default,
        });
    }
    devices
}

/// Open and negotiate a capture device per `config`, leaving the stream primed
/// and running. Every failure past the open closes the partially opened device
/// on the way out.
pub fn open_capture_device(config: &CaptureConfig) -> Result<AlsaDevice, AudioError> {
    let name = config
        .device
        .clone()
        .unwrap_or_else(first_capture_device_name);
    tracing::info!("opening capture device {name}");

    let pcm = PCM::new(&name, Direction::Capture, true)
        .map_err(AudioError::alsa("snd_pcm_open"))?;
    let params = negotiate(&pcm, config)?;
    pcm.prepare().map_err(AudioError::alsa("snd_pcm_prepare"))?;
    pcm.start().map_err(AudioError::alsa("snd_pcm_start"))?;

    tracing::info!(
        rate = params.sample_rate,
        channels = params.channels,
        "capture stream running on {name}"
    );
    Ok(AlsaDevice { pcm, name, params })
}

fn negotiate(pcm: &PCM, config: &CaptureConfig) -> Result<NegotiatedParams, AudioError> {
    let hwp = HwParams::any(pcm).map_err(AudioError::alsa("snd_pcm_hw_params_any"))?;
    hwp.set_access(Access::MMapInterleaved)
        .map_err(AudioError::alsa("snd_pcm_hw_params_set_access"))?;
    hwp.set_format(Format::s16())
        .map_err(AudioError::alsa("snd_pcm_hw_params_set_format"))?;

    if let (Ok(min), Ok(max)) = (hwp.get_rate_min(), hwp.get_rate_max()) {
        tracing::debug!("supported rate range: {min} - {max} Hz");
    }
    let sample_rate = hwp
        .set_rate_near(config.target_sample_rate, ValueOr::Nearest)
        .map_err(|_| AudioError::FormatNotSupported {
            detail: format!("no sample rate near {} Hz", config.target_sample_rate),
        })?;

    let channels = match hwp.set_channels(config.preferred_channels as u32) {
        Ok(()) => config.preferred_channels,
        Err(_) => {
            tracing::warn!(
                "{} channels unsupported, falling back to mono",
                config.preferred_channels
            );
            hwp.set_channels(1)
                .map_err(|_| AudioError::FormatNotSupported {
                    detail: "no usable channel count".into(),
                })?;
            1
        }
    };

    // Device-side transfer buffer: a few iterations worth of frames.
    let wanted = (FRAME_QUOTA * 4) as Frames;
    let granted = hwp
        .set_buffer_size_near(wanted)
        .map_err(AudioError::alsa("snd_pcm_hw_params_set_buffer_size_near"))?;
    if granted != wanted {
        tracing::debug!("device buffer size {granted} frames (requested {wanted})");
    }

    pcm.hw_params(&hwp)
        .map_err(AudioError::alsa("snd_pcm_hw_params"))?;

    Ok(NegotiatedParams {
        sample_rate,
        channels,
        bits_per_sample: 16,
    })
}
