use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use coordinator::{
    CoordinatorOptions, DataSource, PushBridge, PushMessage, PushSource, PushTransport,
    UpdateCoordinator, UpdateError,
};
use infrastructure::{EventEmitter, MqttInMessage, MqttSubscription};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::entity::{CoordinatedSensor, EntityStateEvent};
use crate::registry::{ConfigEntry, EntryManager, LoadedEntry, SetupError};

#[derive(Debug, Deserialize, Clone)]
pub struct ZigbeeSettings {
    pub event_topic: String,
    pub devices: Vec<String>,
}

pub type DeviceReadings = HashMap<String, DeviceReading>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceReading {
    pub state: Option<String>,
    pub battery: Option<f64>,
    pub link_quality: Option<i64>,
}

/// What a device publishes, as tagged variants dispatched by `match`
/// instead of sniffing on the payload shape.
#[derive(Debug, Clone)]
pub enum DeviceMessage {
    StateChanged { device_id: String, state: String },
    BatteryUpdate { device_id: String, battery: f64 },
    Generic { device_id: String, attributes: serde_json::Value },
}

impl DeviceMessage {
    /// Splits one MQTT publish into the tagged messages it carries. The
    /// device id is the last topic segment (`zigbee2mqtt/<device>`).
    fn parse(message: &MqttInMessage) -> anyhow::Result<Vec<DeviceMessage>> {
        let device_id = message
            .topic
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no device id in topic {}", message.topic))?
            .to_string();

        let payload: serde_json::Value = serde_json::from_str(&message.payload)?;

        let mut messages = vec![];

        if let Some(state) = payload.get("state").and_then(|v| v.as_str()) {
            messages.push(DeviceMessage::StateChanged {
                device_id: device_id.clone(),
                state: state.to_string(),
            });
        }

        if let Some(battery) = payload.get("battery").and_then(|v| v.as_f64()) {
            messages.push(DeviceMessage::BatteryUpdate {
                device_id: device_id.clone(),
                battery,
            });
        }

        if messages.is_empty() || payload.get("linkquality").is_some() {
            messages.push(DeviceMessage::Generic {
                device_id,
                attributes: payload,
            });
        }

        Ok(messages)
    }
}

/// Push-only source: the snapshot starts empty and fills up as devices
/// report over MQTT.
pub struct ZigbeeSource;

impl DataSource for ZigbeeSource {
    type Data = DeviceReadings;

    async fn fetch(&self) -> Result<DeviceReadings, UpdateError> {
        Ok(DeviceReadings::new())
    }
}

impl PushSource for ZigbeeSource {
    type Message = MqttInMessage;

    fn merge(
        &self,
        previous: Option<DeviceReadings>,
        message: MqttInMessage,
    ) -> Result<DeviceReadings, UpdateError> {
        let mut readings = previous.unwrap_or_default();

        let messages = DeviceMessage::parse(&message).map_err(|e| {
            UpdateError::unexpected(e.context(format!("device event on {}", message.topic)))
        })?;

        for device_message in messages {
            match device_message {
                DeviceMessage::StateChanged { device_id, state } => {
                    readings.entry(device_id).or_default().state = Some(state);
                }
                DeviceMessage::BatteryUpdate { device_id, battery } => {
                    readings.entry(device_id).or_default().battery = Some(battery);
                }
                DeviceMessage::Generic { device_id, attributes } => {
                    let reading = readings.entry(device_id).or_default();
                    if let Some(link_quality) =
                        attributes.get("linkquality").and_then(|v| v.as_i64())
                    {
                        reading.link_quality = Some(link_quality);
                    }
                }
            }
        }

        Ok(readings)
    }
}

/// Hands a standing MQTT subscription to the push bridge. The MQTT client
/// owns reconnects; this transport only pumps messages into the sink.
pub struct MqttDeviceTransport {
    subscription: Mutex<Option<MqttSubscription>>,
    forwarder: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MqttDeviceTransport {
    pub fn new(subscription: MqttSubscription) -> Self {
        Self {
            subscription: Mutex::new(Some(subscription)),
            forwarder: Mutex::new(None),
        }
    }
}

impl PushTransport for MqttDeviceTransport {
    type Message = MqttInMessage;

    async fn start_listener(
        &self,
        sink: mpsc::Sender<PushMessage<MqttInMessage>>,
    ) -> Result<(), UpdateError> {
        let subscription = self
            .subscription
            .lock()
            .expect("transport lock poisoned")
            .take();

        let Some(mut subscription) = subscription else {
            return Err(UpdateError::transient("MQTT subscription is no longer available"));
        };

        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if sink.send(PushMessage::Event(message)).await.is_err() {
                    break;
                }
            }
        });

        *self.forwarder.lock().expect("transport lock poisoned") = Some(handle);
        Ok(())
    }

    async fn stop_listener(&self) {
        if let Some(handle) = self.forwarder.lock().expect("transport lock poisoned").take() {
            handle.abort();
        }
    }
}

impl ZigbeeSettings {
    /// Loads the zigbee entry: push-only coordinator, bridge over the MQTT
    /// subscription, two sensors per configured device.
    pub async fn setup(
        &self,
        entry: ConfigEntry,
        transport: Arc<MqttDeviceTransport>,
        events: EventEmitter<EntityStateEvent>,
        entries: Arc<EntryManager>,
    ) -> Result<LoadedEntry, SetupError> {
        let coordinator = UpdateCoordinator::new(
            format!("zigbee {}", entry.id),
            ZigbeeSource,
            CoordinatorOptions::push_only(),
        );

        entries.forward_reauth_events(&entry.id, coordinator.subscribe_events());
        coordinator.first_refresh().await?;

        let bridge = PushBridge::new(coordinator.clone(), transport);
        bridge
            .start()
            .await
            .map_err(|e| SetupError::Failed(anyhow::anyhow!(e)))?;

        let mut sensors = vec![];
        for device in &self.devices {
            let device_id = device.clone();
            sensors.push(CoordinatedSensor::new(
                format!("{}_{}_state", entry.id, device),
                coordinator.clone(),
                events.clone(),
                move |readings: &DeviceReadings| {
                    readings.get(&device_id).and_then(|r| r.state.clone())
                },
            ));

            let device_id = device.clone();
            sensors.push(CoordinatedSensor::new(
                format!("{}_{}_battery", entry.id, device),
                coordinator.clone(),
                events.clone(),
                move |readings: &DeviceReadings| {
                    readings
                        .get(&device_id)
                        .and_then(|r| r.battery)
                        .map(|battery| format!("{battery:.0}"))
                },
            ));
        }

        let teardown = Box::pin(async move {
            bridge.stop().await;
            coordinator.shutdown();
            drop(sensors);
        });

        Ok(LoadedEntry::new(entry, teardown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt(topic: &str, payload: &str) -> MqttInMessage {
        MqttInMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_parse_tags_state_and_battery() {
        let message = mqtt(
            "zigbee2mqtt/door_sensor",
            r#"{"state": "OPEN", "battery": 93, "linkquality": 54}"#,
        );

        let messages = DeviceMessage::parse(&message).unwrap();

        assert!(matches!(
            &messages[0],
            DeviceMessage::StateChanged { device_id, state }
                if device_id == "door_sensor" && state == "OPEN"
        ));
        assert!(matches!(
            &messages[1],
            DeviceMessage::BatteryUpdate { device_id, battery }
                if device_id == "door_sensor" && *battery == 93.0
        ));
        assert!(matches!(&messages[2], DeviceMessage::Generic { .. }));
    }

    #[test]
    fn test_parse_falls_back_to_generic() {
        let message = mqtt("zigbee2mqtt/plug", r#"{"power": 12.5}"#);

        let messages = DeviceMessage::parse(&message).unwrap();

        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            DeviceMessage::Generic { device_id, .. } if device_id == "plug"
        ));
    }

    #[test]
    fn test_merge_accumulates_per_device() {
        let source = ZigbeeSource;

        let readings = source
            .merge(
                None,
                mqtt("zigbee2mqtt/door_sensor", r#"{"state": "OPEN", "battery": 93}"#),
            )
            .unwrap();
        let readings = source
            .merge(
                Some(readings),
                mqtt("zigbee2mqtt/plug", r#"{"state": "ON", "linkquality": 80}"#),
            )
            .unwrap();

        assert_eq!(readings.len(), 2);
        assert_eq!(
            readings.get("door_sensor"),
            Some(&DeviceReading {
                state: Some("OPEN".to_string()),
                battery: Some(93.0),
                link_quality: None,
            })
        );
        assert_eq!(
            readings.get("plug"),
            Some(&DeviceReading {
                state: Some("ON".to_string()),
                battery: None,
                link_quality: Some(80),
            })
        );
    }

    #[test]
    fn test_merge_rejects_garbage_payload() {
        let source = ZigbeeSource;

        let result = source.merge(None, mqtt("zigbee2mqtt/plug", "not json"));

        assert!(matches!(result, Err(UpdateError::Unexpected(_))));
    }
}
