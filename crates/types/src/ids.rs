use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::normalize_mac;

/// Canonical device identifier: `tenant:site:primary_mac`.
///
/// Devices are keyed by a stable MAC; the tenant/site pair scopes the
/// namespace. The MAC component is stored normalized (lowercase, no
/// separators) so the same radio never produces two records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId {
    pub tenant: String,
    pub site: String,
    pub mac: String,
}

impl DeviceId {
    pub fn new(tenant: impl Into<String>, site: impl Into<String>, mac: &str) -> Self {
        Self {
            tenant: tenant.into(),
            site: site.into(),
            mac: normalize_mac(mac),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.site, self.mac)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdParseError {
    #[error("device id must be tenant:site:mac, got {0:?}")]
    Malformed(String),
    #[error("device id has an empty component: {0:?}")]
    EmptyComponent(String),
}

impl FromStr for DeviceId {
    type Err = DeviceIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (tenant, site, mac) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(s2), Some(m)) => (t, s2, m),
            _ => return Err(DeviceIdParseError::Malformed(s.to_string())),
        };
        if tenant.is_empty() || site.is_empty() || mac.is_empty() {
            return Err(DeviceIdParseError::EmptyComponent(s.to_string()));
        }
        Ok(DeviceId::new(tenant, site, mac))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let id: DeviceId = "home:main:AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(id.tenant, "home");
        assert_eq!(id.site, "main");
        assert_eq!(id.mac, "aabbccddeeff");
        assert_eq!(id.to_string(), "home:main:aabbccddeeff");
    }

    #[test]
    fn rejects_missing_components() {
        assert!("home:main".parse::<DeviceId>().is_err());
        assert!("home::aabbccddeeff".parse::<DeviceId>().is_err());
    }
}
