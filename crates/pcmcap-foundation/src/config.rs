/// Negotiation targets for opening a capture device.
///
/// The defaults are the engine's fixed contract; there is no reconfiguration
/// while a session is running.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Explicit device identifier. `None` selects the first capture-capable
    /// endpoint found, falling back to `"default"`.
    pub device: Option<String>,
    /// Requested sample rate; the device substitutes the nearest supported value.
    pub target_sample_rate: u32,
    /// Requested channel count; negotiation falls back to mono if unsupported.
    pub preferred_channels: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            target_sample_rate: 44_100,
            preferred_channels: 2,
        }
    }
}
