//! Environment-sourced application settings.
//!
//! Settings are read once at startup from `FCS_*` environment variables
//! (a local `.env` file is honoured via dotenvy in `main`). The five
//! identity/connection fields are mandatory; everything else has a default.

use figment::providers::Env;
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub cs_id: String,
    pub vendor: String,
    pub model: String,
    pub ws_url: String,
    pub password: String,

    #[serde(default = "default_connectors")]
    pub connectors: u32,

    /// When set, plug in and authorize automatically after boot.
    #[serde(default)]
    pub quick_start: bool,
    #[serde(default = "default_quick_start_rfid")]
    pub quick_start_rfid: String,
    #[serde(default = "default_quick_start_connector")]
    pub quick_start_connector: u32,
    /// Watts to start charging with right after the quick-start transaction.
    #[serde(default)]
    pub quick_start_charging: Option<f64>,

    /// Defer booting until a session-plan request arrives.
    #[serde(default)]
    pub on_demand: bool,

    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_connectors() -> u32 {
    1
}

fn default_quick_start_rfid() -> String {
    "12341234".to_string()
}

fn default_quick_start_connector() -> u32 {
    1
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from `FCS_*` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new().merge(Env::prefixed("FCS_")).extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_prefixed_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FCS_CS_ID", "station-1");
            jail.set_env("FCS_VENDOR", "VendorX");
            jail.set_env("FCS_MODEL", "ModelY");
            jail.set_env("FCS_WS_URL", "ws://csms.example/ocpp");
            jail.set_env("FCS_PASSWORD", "secret");
            jail.set_env("FCS_CONNECTORS", "3");
            jail.set_env("FCS_QUICK_START", "true");
            jail.set_env("FCS_QUICK_START_CHARGING", "400");

            let settings = Settings::load()?;
            assert_eq!(settings.cs_id, "station-1");
            assert_eq!(settings.connectors, 3);
            assert!(settings.quick_start);
            assert_eq!(settings.quick_start_charging, Some(400.0));
            assert_eq!(settings.quick_start_rfid, "12341234");
            assert_eq!(settings.quick_start_connector, 1);
            assert!(!settings.on_demand);
            assert_eq!(settings.api_port, 8000);
            Ok(())
        });
    }

    #[test]
    fn missing_identity_fields_fail_the_load() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FCS_CS_ID", "station-1");
            assert!(Settings::load().is_err());
            Ok(())
        });
    }
}
