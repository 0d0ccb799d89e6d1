//! Real-time interaction pipeline.
//!
//! The [`AudioPipeline`] owns capture and playback; the [`BargeInDetector`]
//! runs beside it on tokio and aborts playback when the user talks over it.

pub mod audio_pipeline;
pub mod barge_in;
pub mod error;
pub mod sink;
pub mod state;

pub use audio_pipeline::{AudioPipeline, PipelineConfig, PipelineStats};
pub use barge_in::{
    BargeInConfig, BargeInDetector, BargeInHandle, BargeInState, BargeInStats, EnergyMeter,
    EnergySource, InterruptionEvent, Sensitivity,
};
pub use error::{CallbackFault, ErrorReporter, LogReporter};
pub use sink::{ChannelSink, CollectorSink, NullSink, SegmentSink};
pub use state::PipelineState;
