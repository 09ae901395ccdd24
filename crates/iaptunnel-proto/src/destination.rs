//! Tunnel destination types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing an instance resource path
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocatorParseError {
    #[error("Invalid instance path '{0}', expected projects/PROJECT/zones/ZONE/instances/NAME")]
    InvalidFormat(String),

    #[error("Empty {0} in instance path")]
    EmptySegment(&'static str),
}

/// Identifies a VM instance by project, zone and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    /// Resource path in `projects/P/zones/Z/instances/I` form
    pub fn resource_path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.name
        )
    }
}

impl FromStr for InstanceLocator {
    type Err = LocatorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();

        match parts.as_slice() {
            ["projects", project, "zones", zone, "instances", name] => {
                if project.is_empty() {
                    return Err(LocatorParseError::EmptySegment("project"));
                }
                if zone.is_empty() {
                    return Err(LocatorParseError::EmptySegment("zone"));
                }
                if name.is_empty() {
                    return Err(LocatorParseError::EmptySegment("instance name"));
                }
                Ok(Self::new(*project, *zone, *name))
            }
            _ => Err(LocatorParseError::InvalidFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for InstanceLocator {
    type Error = LocatorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceLocator> for String {
    fn from(locator: InstanceLocator) -> Self {
        locator.to_string()
    }
}

/// Remote end of a tunnel: an instance and a port on it
///
/// Immutable, compared by value, and used as the correlation key in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelDestination {
    instance: InstanceLocator,
    port: u16,
}

impl TunnelDestination {
    pub fn new(instance: InstanceLocator, port: u16) -> Self {
        Self { instance, port }
    }

    pub fn instance(&self) -> &InstanceLocator {
        &self.instance
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TunnelDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.port)
    }
}
