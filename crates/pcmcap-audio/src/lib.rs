pub mod capture;
pub mod chunker;
pub mod device;
pub mod recovery;
pub mod session;
pub mod sink;
pub mod spool;

#[cfg(test)]
pub(crate) mod testing;

// Public API
pub use capture::{CaptureStats, FRAME_QUOTA};
pub use chunker::{Rechunker, CHUNK_BYTES};
pub use device::{
    enumerate_capture_devices, first_capture_device_name, open_capture_device, AlsaDevice,
    CapturePcm, DeviceInfo, NegotiatedParams,
};
pub use session::CaptureSession;
pub use sink::{ChunkSink, SharedSink};
