//! Audio device discovery.
//!
//! The pipeline only needs three questions answered: which devices exist,
//! which one is the default, and which one a user-supplied name or index
//! refers to. [`DeviceDiscovery`] is that narrow interface.

use crate::error::{Result, VoxbridgeError};
use serde::Serialize;
use std::fmt;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// One audio endpoint as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Position in the listing for this direction.
    pub index: usize,
    pub name: String,
    pub direction: Direction,
    /// Preferred routing device (PipeWire/PulseAudio).
    pub recommended: bool,
}

/// How a user picked a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Name(String),
    Index(usize),
}

impl DeviceSelector {
    /// Parses a config/CLI value: empty or "default" → default, digits → index,
    /// anything else → name.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => DeviceSelector::Default,
            Some(v) if v.eq_ignore_ascii_case("default") => DeviceSelector::Default,
            Some(v) => match v.parse::<usize>() {
                Ok(index) => DeviceSelector::Index(index),
                Err(_) => DeviceSelector::Name(v.to_string()),
            },
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Name(name) => write!(f, "{}", name),
            DeviceSelector::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// Device enumeration and selection.
pub trait DeviceDiscovery: Send + Sync {
    /// Lists candidate devices for a direction.
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>>;

    /// Returns the device to use when the user did not pick one.
    fn default_device(&self, direction: Direction) -> Option<DeviceInfo>;

    /// Resolves a selector to a device.
    ///
    /// Names match exactly first, then case-insensitively as a substring.
    fn resolve(&self, direction: Direction, selector: &DeviceSelector) -> Option<DeviceInfo> {
        match selector {
            DeviceSelector::Default => self.default_device(direction),
            DeviceSelector::Index(index) => self
                .list_devices(direction)
                .ok()?
                .into_iter()
                .find(|d| d.index == *index),
            DeviceSelector::Name(name) => {
                let devices = self.list_devices(direction).ok()?;
                if let Some(exact) = devices.iter().find(|d| &d.name == name) {
                    return Some(exact.clone());
                }
                let needle = name.to_lowercase();
                devices
                    .into_iter()
                    .find(|d| d.name.to_lowercase().contains(&needle))
            }
        }
    }
}

/// In-memory device list for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct MockDiscovery {
    inputs: Vec<String>,
    outputs: Vec<String>,
    fail_listing: bool,
}

impl MockDiscovery {
    /// Creates a discovery with no devices at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the input devices (the first one is the default)
    pub fn with_inputs(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Configure the output devices (the first one is the default)
    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Configure listing to fail
    pub fn with_listing_failure(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    fn names(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }
}

impl DeviceDiscovery for MockDiscovery {
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>> {
        if self.fail_listing {
            return Err(VoxbridgeError::DriverUnavailable {
                message: format!("mock {} listing failure", direction),
            });
        }
        Ok(self
            .names(direction)
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceInfo {
                index,
                name: name.clone(),
                direction,
                recommended: index == 0,
            })
            .collect())
    }

    fn default_device(&self, direction: Direction) -> Option<DeviceInfo> {
        self.list_devices(direction).ok()?.into_iter().next()
    }
}
