//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod recorder;
pub mod resolver;

pub use buffer::{BoundedFrameQueue, FrameBuffer, SharedFrameQueue};
pub use capture::{open_frame_source, CallbackSource, FrameSource, PollingSource, SampleTap, StreamHandle};
pub use device::{CpalCatalog, DeviceCatalog, DeviceDescriptor, DeviceInventory};
pub use playback::{mono_to_stereo, CpalPlayback, PcmSink};
pub use recorder::{record_test, RecordingSummary};
pub use resolver::DeviceResolver;
