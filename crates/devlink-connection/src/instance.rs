use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Booting,
    Success,
    BootFail,
    Fail,
    DeviceOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.trim().rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Descriptor of a launched virtual device as reported by the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInstanceInfo {
    pub instance_name: String,
    pub host_and_port: Option<HostAndPort>,
    pub status: VmStatus,
    pub errors: String,
    pub error_type: Option<ErrorId>,
    pub error_signature: Option<String>,
    pub skip_log_collection: bool,
    pub device_offset: Option<u32>,
    pub instance_user: Option<String>,
    pub ip_preconfigured: bool,
    pub build_vars: BTreeMap<String, String>,
}

impl VmInstanceInfo {
    pub fn new(instance_name: impl Into<String>, host_and_port: HostAndPort, status: VmStatus) -> Self {
        Self {
            instance_name: instance_name.into(),
            host_and_port: Some(host_and_port),
            status,
            errors: String::new(),
            error_type: None,
            error_signature: None,
            skip_log_collection: false,
            device_offset: None,
            instance_user: None,
            ip_preconfigured: false,
            build_vars: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host_and_port.as_ref().map(|hp| hp.host.as_str())
    }

    /// Instance user recorded by the launcher, else the configured one.
    pub fn user_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.instance_user.as_deref().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_parses_last_colon() {
        assert_eq!(
            HostAndPort::parse("10.1.2.3:6520"),
            Some(HostAndPort::new("10.1.2.3", 6520))
        );
        assert_eq!(HostAndPort::parse(":6520"), None);
        assert_eq!(HostAndPort::parse("host:port"), None);
        assert_eq!(HostAndPort::new("h", 1).to_string(), "h:1");
    }
}
