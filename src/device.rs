//! Controller discovery and identity resolution
//!
//! Event nodes are found through udev (`input` subsystem, `event*` sysnames).
//! The product name and the link address live on the parent `inputN` device
//! as the `name` and `uniq` sysfs attributes.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Product names reported by the kernel for supported controllers
pub const DEFAULT_CONTROLLER_NAMES: &[&str] = &["Wireless Controller", "DualSense Wireless Controller"];

/// Errors that make enumeration impossible as a whole
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to create udev enumerator: {0}")]
    Enumerator(#[source] std::io::Error),

    #[error("failed to scan the input subsystem: {0}")]
    Scan(#[source] std::io::Error),
}

/// A node seen during a scan, before the name filter
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: PathBuf,
    pub syspath: PathBuf,
    /// `None` when the name attribute could not be read
    pub name: Option<String>,
}

/// Snapshot of a matched controller node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub node: PathBuf,
    pub syspath: PathBuf,
    pub name: String,
}

/// Bluetooth address of a controller, normalized to `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Parse a link address; returns `None` for anything but six hex octets
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let octets: Vec<&str> = raw.split(':').collect();
        if octets.len() != 6 {
            return None;
        }

        let valid = octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return None;
        }

        Some(Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `AA_BB_CC_DD_EE_FF`, as used in BlueZ object paths and marker file names
    pub fn underscored(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of input device metadata
pub trait DeviceSource {
    /// Every candidate event node currently present
    fn candidates(&self) -> Result<Vec<Candidate>, ScanError>;

    /// Link address of a device, if it still exists and has one
    fn identity(&self, device: &Device) -> Option<Identity>;
}

/// List all connected controllers whose name is in `names`
pub fn list_controllers<S: DeviceSource + ?Sized>(
    source: &S,
    names: &[String],
) -> Result<Vec<Device>, ScanError> {
    Ok(filter_controllers(source.candidates()?, names))
}

/// Keep the candidates whose name exactly matches one of `names`
pub fn filter_controllers(candidates: Vec<Candidate>, names: &[String]) -> Vec<Device> {
    candidates
        .into_iter()
        .filter_map(|c| {
            let Some(name) = c.name else {
                debug!("Skipping {:?}: name not readable", c.node);
                return None;
            };

            if !names.iter().any(|n| *n == name) {
                return None;
            }

            Some(Device {
                node: c.node,
                syspath: c.syspath,
                name,
            })
        })
        .collect()
}

/// udev-backed device source
#[derive(Debug, Default, Clone, Copy)]
pub struct UdevSource;

impl UdevSource {
    pub fn new() -> Self {
        Self
    }

    /// Read an attribute from the parent `inputN` device of an event node
    fn parent_attribute(syspath: &Path, attribute: &str) -> Option<String> {
        let device = match udev::Device::from_syspath(syspath) {
            Ok(device) => device,
            Err(e) => {
                debug!("Device {:?} gone: {}", syspath, e);
                return None;
            }
        };

        let parent = device.parent()?;
        let value = parent.attribute_value(attribute)?;
        Some(value.to_string_lossy().trim().to_string())
    }
}

impl DeviceSource for UdevSource {
    fn candidates(&self) -> Result<Vec<Candidate>, ScanError> {
        let mut enumerator = udev::Enumerator::new().map_err(ScanError::Enumerator)?;
        enumerator
            .match_subsystem("input")
            .map_err(ScanError::Enumerator)?;
        enumerator
            .match_sysname("event*")
            .map_err(ScanError::Enumerator)?;

        let mut candidates = Vec::new();
        for device in enumerator.scan_devices().map_err(ScanError::Scan)? {
            let Some(node) = device.devnode() else {
                debug!("Skipping {:?}: no device node", device.syspath());
                continue;
            };

            let name = device
                .parent()
                .and_then(|p| p.attribute_value("name").map(|v| v.to_string_lossy().trim().to_string()));

            candidates.push(Candidate {
                node: node.to_path_buf(),
                syspath: device.syspath().to_path_buf(),
                name,
            });
        }

        Ok(candidates)
    }

    fn identity(&self, device: &Device) -> Option<Identity> {
        let uniq = Self::parent_attribute(&device.syspath, "uniq")?;
        let identity = Identity::parse(&uniq);
        if identity.is_none() {
            debug!(
                "{:?} ('{}') has no wireless link address (uniq='{}')",
                device.node, device.name, uniq
            );
        }
        identity
    }
}
