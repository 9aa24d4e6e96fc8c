use serde::{Deserialize, Serialize};

use crate::device::types::DeviceIdentity;

fn default_connection_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address of the bound device; unset until a device has been discovered.
    #[serde(default)]
    pub address: Option<String>,
    /// Advertised name at the time the device was bound.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_connection_enabled")]
    pub connection_enabled: bool,
}

impl Config {
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.address.as_deref().map(|address| DeviceIdentity::new(address, self.name.clone()))
    }

    pub fn bind(&mut self, identity: &DeviceIdentity) {
        self.address = Some(identity.address().to_string());
        self.name = identity.name().map(String::from);
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: None,
            name: None,
            connection_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.connection_enabled);
        assert!(config.identity().is_none());
    }

    #[test]
    fn camel_case_round_trip() {
        let mut config = Config::default();
        config.bind(&DeviceIdentity::new("aa:bb:cc:dd:ee:ff", Some("PRS12345".to_string())));
        config.connection_enabled = false;

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"connectionEnabled\":false"));
        assert!(json.contains("\"address\":\"AA:BB:CC:DD:EE:FF\""));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.identity().unwrap().name(), Some("PRS12345"));
    }
}
