//! Audio I/O driver abstraction.
//!
//! A driver opens device streams and invokes the pipeline's callbacks on its
//! own threads. Callbacks receive interleaved 16-bit samples in the channel
//! layout given by [`StreamSpec`].

use crate::audio::devices::DeviceInfo;
use crate::error::{Result, VoxbridgeError};
use std::sync::{Arc, Mutex, PoisonError};

/// Called by the driver with captured interleaved samples.
pub type InputCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Called by the driver to fill an interleaved output buffer.
pub type OutputCallback = Box<dyn FnMut(&mut [i16]) + Send + 'static>;

/// Stream format requested from a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Opens and closes device streams.
pub trait AudioDriver: Send {
    /// False when there is no usable audio backend at all.
    fn is_available(&self) -> bool;

    fn open_input(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<()>;

    fn open_output(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<()>;

    /// Stops the input stream. Safe to call when nothing is open.
    fn close_input(&mut self);

    /// Stops the output stream. Safe to call when nothing is open.
    fn close_output(&mut self);
}

/// Driver for headless environments: never opens anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

impl AudioDriver for NullDriver {
    fn is_available(&self) -> bool {
        false
    }

    fn open_input(&mut self, _: &DeviceInfo, _: StreamSpec, _: InputCallback) -> Result<()> {
        Err(VoxbridgeError::DriverUnavailable {
            message: "no audio backend".to_string(),
        })
    }

    fn open_output(&mut self, _: &DeviceInfo, _: StreamSpec, _: OutputCallback) -> Result<()> {
        Err(VoxbridgeError::DriverUnavailable {
            message: "no audio backend".to_string(),
        })
    }

    fn close_input(&mut self) {}

    fn close_output(&mut self) {}
}

/// Driver that lets the caller act as the audio hardware.
///
/// Clones share the same streams: hand one clone to the pipeline and keep the
/// other to push captured audio and pull playback audio.
#[derive(Clone, Default)]
pub struct MockDriver {
    input: Arc<Mutex<Option<(StreamSpec, InputCallback)>>>,
    output: Arc<Mutex<Option<(StreamSpec, OutputCallback)>>>,
    fail_open: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the mock to fail when opening streams
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Delivers samples to the input callback, as a capture device would.
    ///
    /// Returns false if no input stream is open.
    pub fn push_input(&self, samples: &[i16]) -> bool {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        match input.as_mut() {
            Some((_, callback)) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// Asks the output callback for `len` interleaved samples.
    ///
    /// Returns `None` if no output stream is open.
    pub fn pull_output(&self, len: usize) -> Option<Vec<i16>> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.as_mut().map(|(_, callback)| {
            let mut buffer = vec![0i16; len];
            callback(&mut buffer);
            buffer
        })
    }

    pub fn input_spec(&self) -> Option<StreamSpec> {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(spec, _)| *spec)
    }

    pub fn output_spec(&self) -> Option<StreamSpec> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(spec, _)| *spec)
    }

    pub fn is_input_open(&self) -> bool {
        self.input_spec().is_some()
    }

    pub fn is_output_open(&self) -> bool {
        self.output_spec().is_some()
    }
}

impl AudioDriver for MockDriver {
    fn is_available(&self) -> bool {
        true
    }

    fn open_input(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<()> {
        if self.fail_open {
            return Err(VoxbridgeError::AudioStream {
                message: format!("mock failure opening {}", device.name),
            });
        }
        *self.input.lock().unwrap_or_else(PoisonError::into_inner) = Some((spec, callback));
        Ok(())
    }

    fn open_output(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<()> {
        if self.fail_open {
            return Err(VoxbridgeError::AudioStream {
                message: format!("mock failure opening {}", device.name),
            });
        }
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some((spec, callback));
        Ok(())
    }

    fn close_input(&mut self) {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn close_output(&mut self) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Picks the real driver when compiled with cpal, [`NullDriver`] otherwise.
pub fn default_driver() -> Box<dyn AudioDriver> {
    #[cfg(feature = "cpal-audio")]
    {
        Box::new(crate::audio::cpal_io::CpalDriver::new())
    }
    #[cfg(not(feature = "cpal-audio"))]
    {
        Box::new(NullDriver)
    }
}
