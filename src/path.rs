//! `PropertyPath`: the `/device/property` addressing scheme used everywhere a
//! request, event, or snapshot needs to name a piece of device state.
//!
//! Grounded on `examples/original_source/src/device/propertypath.h`: a path is
//! either the empty path (used where an event has no associated path), the root
//! path `/` (enumerates devices), a device path `/device` (enumerates that
//! device's properties), or a property path `/device/property` (a single node).
//! Ordering and equality are lexicographic on the canonical string form, exactly
//! as the C++ `operator<` does via `ToString()`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyPath {
    root: bool,
    device: Option<String>,
    property: Option<String>,
}

impl PropertyPath {
    /// The empty path: no device, no property, not root. Used for events that
    /// carry no path (`TaskStateChanged`, `TaskMessage`, ...).
    pub fn empty() -> Self {
        PropertyPath {
            root: false,
            device: None,
            property: None,
        }
    }

    /// `/` — enumerates devices.
    pub fn root() -> Self {
        PropertyPath {
            root: true,
            device: None,
            property: None,
        }
    }

    /// `/device` — enumerates that device's properties.
    pub fn device(name: impl Into<String>) -> Self {
        PropertyPath {
            root: false,
            device: Some(name.into()),
            property: None,
        }
    }

    /// `/device/property` — a single node.
    pub fn property(device: impl Into<String>, property: impl Into<String>) -> Self {
        PropertyPath {
            root: false,
            device: Some(device.into()),
            property: Some(property.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.root && self.device.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn is_device(&self) -> bool {
        self.device.is_some() && self.property.is_none()
    }

    pub fn is_property(&self) -> bool {
        self.device.is_some() && self.property.is_some()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.as_deref()
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.root, &self.device, &self.property) {
            (_, None, _) if !self.root => Ok(()),
            (true, None, _) => write!(f, "/"),
            (_, Some(device), None) => write!(f, "/{device}"),
            (_, Some(device), Some(property)) => write!(f, "/{device}/{property}"),
            _ => Ok(()),
        }
    }
}

impl FromStr for PropertyPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(PropertyPath::empty());
        }
        if s == "/" {
            return Ok(PropertyPath::root());
        }
        if !s.starts_with('/') {
            return Err(CoreError::InvalidArgument(format!(
                "property path must start with '/': {s:?}"
            )));
        }
        let mut segments = s[1..].split('/');
        let device = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            CoreError::InvalidArgument(format!("property path missing device segment: {s:?}"))
        })?;
        let property = segments.next();
        if segments.next().is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "property path has too many segments: {s:?}"
            )));
        }
        match property {
            None => Ok(PropertyPath::device(device)),
            Some(property) if !property.is_empty() => {
                Ok(PropertyPath::property(device, property))
            }
            Some(_) => Err(CoreError::InvalidArgument(format!(
                "property path has an empty property segment: {s:?}"
            ))),
        }
    }
}

impl PartialOrd for PropertyPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl Serialize for PropertyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PropertyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PropertyPath::from_str(&raw).map_err(de::Error::custom)
    }
}
