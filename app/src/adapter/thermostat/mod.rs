use std::sync::Arc;

use coordinator::{CoordinatorOptions, DataSource, UpdateCoordinator, UpdateError};
use infrastructure::{EventEmitter, HttpClientConfig};
use serde::Deserialize;
use support::time::Duration;

use crate::entity::{CoordinatedSensor, EntityStateEvent};
use crate::registry::{ConfigEntry, EntryManager, LoadedEntry, SetupError};

#[derive(Debug, Deserialize, Clone)]
pub struct ThermostatSettings {
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::seconds(30)
}

/// One reading of the heater, as served by its local JSON endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThermostatReport {
    pub current_temperature: f64,
    pub target_temperature: f64,
    pub heating: bool,
    #[serde(default)]
    pub water_pressure: Option<f64>,
}

pub struct ThermostatSource {
    client: reqwest::Client,
    url: String,
}

impl DataSource for ThermostatSource {
    type Data = ThermostatReport;

    async fn fetch(&self) -> Result<ThermostatReport, UpdateError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(super::classify_http_error)?;

        response.json().await.map_err(|e| {
            UpdateError::unexpected(anyhow::anyhow!("malformed thermostat report: {e}"))
        })
    }
}

impl ThermostatSettings {
    /// Loads the thermostat entry: coordinator, setup refresh, sensors.
    pub async fn setup(
        &self,
        entry: ConfigEntry,
        events: EventEmitter<EntityStateEvent>,
        entries: Arc<EntryManager>,
    ) -> Result<LoadedEntry, SetupError> {
        let client = HttpClientConfig::new(self.token.clone())
            .new_client()
            .map_err(SetupError::Failed)?;

        let source = ThermostatSource {
            client,
            url: self.url.clone(),
        };

        let mut options = CoordinatorOptions::polling(self.poll_interval);
        options.fetch_timeout = Duration::seconds(15);
        options.min_refresh_interval = Some(Duration::seconds(5));

        let coordinator =
            UpdateCoordinator::new(format!("thermostat {}", entry.id), source, options);

        entries.forward_reauth_events(&entry.id, coordinator.subscribe_events());
        coordinator.first_refresh().await?;

        let sensors = vec![
            CoordinatedSensor::new(
                format!("{}_temperature", entry.id),
                coordinator.clone(),
                events.clone(),
                |report: &ThermostatReport| Some(format!("{:.1}", report.current_temperature)),
            ),
            CoordinatedSensor::new(
                format!("{}_target_temperature", entry.id),
                coordinator.clone(),
                events.clone(),
                |report: &ThermostatReport| Some(format!("{:.1}", report.target_temperature)),
            ),
            CoordinatedSensor::new(
                format!("{}_heating", entry.id),
                coordinator.clone(),
                events.clone(),
                |report: &ThermostatReport| {
                    Some(if report.heating { "on" } else { "off" }.to_string())
                },
            ),
            CoordinatedSensor::new(
                format!("{}_water_pressure", entry.id),
                coordinator.clone(),
                events,
                |report: &ThermostatReport| {
                    report.water_pressure.map(|bar| format!("{bar:.2}"))
                },
            ),
        ];

        let teardown = Box::pin(async move {
            drop(sensors);
            coordinator.shutdown();
        });

        Ok(LoadedEntry::new(entry, teardown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_parses_device_payload() {
        let payload = r#"{
            "current_temperature": 21.3,
            "target_temperature": 22.0,
            "heating": true,
            "water_pressure": 1.62,
            "firmware": "4.12"
        }"#;

        let report: ThermostatReport = serde_json::from_str(payload).unwrap();

        assert_eq!(
            report,
            ThermostatReport {
                current_temperature: 21.3,
                target_temperature: 22.0,
                heating: true,
                water_pressure: Some(1.62),
            }
        );
    }

    #[test]
    fn test_report_tolerates_missing_pressure() {
        let payload = r#"{
            "current_temperature": 18.0,
            "target_temperature": 20.0,
            "heating": false
        }"#;

        let report: ThermostatReport = serde_json::from_str(payload).unwrap();

        assert_eq!(report.water_pressure, None);
    }
}
