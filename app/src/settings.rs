use config::{Config, ConfigError, Environment, File};
use infrastructure::{MonitoringConfig, MqttConfig};
use serde::Deserialize;

use crate::adapter::quake_feed::QuakeFeedSettings;
use crate::adapter::thermostat::ThermostatSettings;
use crate::adapter::zigbee::ZigbeeSettings;

/// Platform configuration. An absent integration section simply means no
/// entry of that kind is set up.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub monitoring: MonitoringConfig,
    pub mqtt: MqttConfig,
    pub thermostat: Option<ThermostatSettings>,
    pub zigbee: Option<ZigbeeSettings>,
    pub quake_feed: Option<QuakeFeedSettings>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config.toml"))
            .add_source(Environment::default().separator("_").list_separator(","));

        let s = builder.build()?;
        s.try_deserialize()
    }
}
