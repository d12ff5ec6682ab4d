use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("audio subsystem error: {0}")]
    Audio(#[from] AudioError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("capture device not found: {name:?}")]
    DeviceNotFound { name: Option<String> },

    #[error("format not supported: {detail}")]
    FormatNotSupported { detail: String },

    #[error("{op} failed: {source}")]
    Alsa {
        op: &'static str,
        #[source]
        source: alsa::Error,
    },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("fatal error, cannot recover: {0}")]
    Fatal(String),
}

impl AudioError {
    /// Adapter for `map_err` on alsa calls, tagging the failing operation.
    pub fn alsa(op: &'static str) -> impl FnOnce(alsa::Error) -> AudioError {
        move |source| AudioError::Alsa { op, source }
    }

    /// Errno of the underlying device fault, when the error came from the device.
    pub fn device_errno(&self) -> Option<i32> {
        match self {
            AudioError::Alsa { source, .. } => Some(source.errno()),
            _ => None,
        }
    }
}
