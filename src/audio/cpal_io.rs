//! Device discovery and stream I/O using CPAL (Cross-Platform Audio Library).

use crate::audio::devices::{DeviceDiscovery, DeviceInfo, Direction};
use crate::audio::driver::{AudioDriver, InputCallback, OutputCallback, StreamSpec};
use crate::error::{Result, VoxbridgeError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex, PoisonError};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probes every backend it knows (ALSA, JACK, PulseAudio) and the losers
/// print to stderr. The messages are harmless but confusing to users.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// ALSA channel-map aliases: never a sensible endpoint in either direction.
const CHANNEL_MAP_PATTERNS: &[&str] = &["surround", "front:", "rear:", "center:", "side:"];

/// Outputs that can't capture a voice.
const OUTPUT_ONLY_PATTERNS: &[&str] = &["Digital Output", "HDMI", "S/PDIF"];

fn contains_any(name: &str, patterns: &[&str]) -> bool {
    let lower = name.to_lowercase();
    patterns
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// Check if a device name should be hidden for a direction.
fn should_filter_device(name: &str, direction: Direction) -> bool {
    contains_any(name, CHANNEL_MAP_PATTERNS)
        || (direction == Direction::Input && contains_any(name, OUTPUT_ONLY_PATTERNS))
}

fn is_preferred_device(name: &str) -> bool {
    contains_any(name, PREFERRED_DEVICES)
}

/// Enumerates devices for a direction, skipping filtered ones.
///
/// Returns the devices alongside their listing info so the driver can open
/// exactly what discovery reported.
fn enumerate(direction: Direction) -> Result<Vec<(DeviceInfo, cpal::Device)>> {
    let devices = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        match direction {
            Direction::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
            Direction::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
        }
    })
    .map_err(|e| VoxbridgeError::DriverUnavailable {
        message: format!("Failed to enumerate {} devices: {}", direction, e),
    })?;

    let mut listed = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        if should_filter_device(&name, direction) {
            continue;
        }
        let info = DeviceInfo {
            index: listed.len(),
            recommended: is_preferred_device(&name),
            name,
            direction,
        };
        listed.push((info, device));
    }
    Ok(listed)
}

/// Device discovery backed by the default CPAL host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDiscovery;

impl CpalDiscovery {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDiscovery for CpalDiscovery {
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>> {
        Ok(enumerate(direction)?
            .into_iter()
            .map(|(info, _)| info)
            .collect())
    }

    /// Prefers PipeWire/PulseAudio, then the host's own default.
    fn default_device(&self, direction: Direction) -> Option<DeviceInfo> {
        let devices = self.list_devices(direction).ok()?;
        if let Some(preferred) = devices.iter().find(|d| d.recommended) {
            return Some(preferred.clone());
        }

        let host_default = with_suppressed_stderr(|| {
            let host = cpal::default_host();
            match direction {
                Direction::Input => host.default_input_device(),
                Direction::Output => host.default_output_device(),
            }
        })
        .and_then(|d| d.name().ok());

        match host_default {
            Some(name) => devices
                .iter()
                .find(|d| d.name == name)
                .cloned()
                .or_else(|| devices.into_iter().next()),
            None => devices.into_iter().next(),
        }
    }
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only created, paused and dropped through `&mut
/// CpalDriver`, so it is never touched from two threads at once.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Audio driver using CPAL streams.
///
/// Input streams are tried as i16 first, then as f32 with conversion; the same
/// for output. The format itself (rate and channels) is the one requested in
/// [`StreamSpec`]; PipeWire and PulseAudio convert transparently.
#[derive(Default)]
pub struct CpalDriver {
    input: Option<SendableStream>,
    output: Option<SendableStream>,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_device(device: &DeviceInfo) -> Result<cpal::Device> {
        enumerate(device.direction)?
            .into_iter()
            .find(|(info, _)| info.name == device.name)
            .map(|(_, d)| d)
            .ok_or_else(|| VoxbridgeError::AudioDeviceNotFound {
                device: device.name.clone(),
            })
    }

    fn stream_config(spec: StreamSpec) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(spec.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    fn build_input(
        device: &cpal::Device,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<cpal::Stream> {
        let config = Self::stream_config(spec);
        let callback = Arc::new(Mutex::new(callback));

        let err_callback = |err| {
            tracing::error!("Audio input stream error: {}", err);
        };

        let cb = Arc::clone(&callback);
        if let Ok(stream) = device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
                (*cb)(data);
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let cb = Arc::clone(&callback);
        let mut converted: Vec<i16> = Vec::new();
        device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    converted.clear();
                    converted.extend(data.iter().map(|&s| f32_to_i16(s)));
                    let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
                    (*cb)(&converted);
                },
                err_callback,
                None,
            )
            .map_err(|e| VoxbridgeError::AudioStream {
                message: format!("Failed to build input stream: {}", e),
            })
    }

    fn build_output(
        device: &cpal::Device,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<cpal::Stream> {
        let config = Self::stream_config(spec);
        let callback = Arc::new(Mutex::new(callback));

        let err_callback = |err| {
            tracing::error!("Audio output stream error: {}", err);
        };

        let cb = Arc::clone(&callback);
        if let Ok(stream) = device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
                (*cb)(data);
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let cb = Arc::clone(&callback);
        let mut scratch: Vec<i16> = Vec::new();
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.clear();
                    scratch.resize(data.len(), 0);
                    {
                        let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
                        (*cb)(&mut scratch);
                    }
                    for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                        *out = s as f32 / i16::MAX as f32;
                    }
                },
                err_callback,
                None,
            )
            .map_err(|e| VoxbridgeError::AudioStream {
                message: format!("Failed to build output stream: {}", e),
            })
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

impl AudioDriver for CpalDriver {
    fn is_available(&self) -> bool {
        with_suppressed_stderr(|| {
            let host = cpal::default_host();
            host.default_input_device().is_some() || host.default_output_device().is_some()
        })
    }

    fn open_input(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: InputCallback,
    ) -> Result<()> {
        self.close_input();
        let cpal_device = Self::find_device(device)?;
        let stream = with_suppressed_stderr(|| Self::build_input(&cpal_device, spec, callback))?;
        stream.play().map_err(|e| VoxbridgeError::AudioStream {
            message: format!("Failed to start input stream: {}", e),
        })?;
        tracing::info!(
            device = %device.name,
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "input stream started"
        );
        self.input = Some(SendableStream(stream));
        Ok(())
    }

    fn open_output(
        &mut self,
        device: &DeviceInfo,
        spec: StreamSpec,
        callback: OutputCallback,
    ) -> Result<()> {
        self.close_output();
        let cpal_device = Self::find_device(device)?;
        let stream = with_suppressed_stderr(|| Self::build_output(&cpal_device, spec, callback))?;
        stream.play().map_err(|e| VoxbridgeError::AudioStream {
            message: format!("Failed to start output stream: {}", e),
        })?;
        tracing::info!(
            device = %device.name,
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "output stream started"
        );
        self.output = Some(SendableStream(stream));
        Ok(())
    }

    fn close_input(&mut self) {
        if let Some(stream) = self.input.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::warn!("Failed to pause input stream: {}", e);
        }
    }

    fn close_output(&mut self) {
        if let Some(stream) = self.output.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::warn!("Failed to pause output stream: {}", e);
        }
    }
}
