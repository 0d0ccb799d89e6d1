//! Audio capture side: frames, buffering, classification and segmentation.

#[cfg(feature = "cpal-audio")]
pub mod cpal_io;
pub mod devices;
pub mod driver;
pub mod frame;
pub mod ring_buffer;
pub mod segmenter;
pub mod vad;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use cpal_io::{CpalDiscovery, CpalDriver};
pub use devices::{DeviceDiscovery, DeviceInfo, DeviceSelector, Direction, MockDiscovery};
pub use driver::{AudioDriver, MockDriver, NullDriver, StreamSpec, default_driver};
pub use frame::{Frame, FrameFormat};
pub use ring_buffer::SampleRingBuffer;
pub use segmenter::{SegmenterConfig, SegmenterState, SpeechSegment, SpeechSegmenter};
pub use vad::{
    ClassificationState, Clock, EnergyVad, ManualClock, SpeechClassifier, SystemClock,
    VadBackend, VadBackendKind, VadMode,
};
