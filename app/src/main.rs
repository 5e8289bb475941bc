use std::sync::Arc;

use infrastructure::EventBus;
use settings::Settings;

use crate::adapter::zigbee::MqttDeviceTransport;
use crate::frontends::StateLog;
use crate::registry::{ConfigEntry, EntryManager};

mod adapter;
mod entity;
mod frontends;
mod registry;
mod settings;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() {
    let settings = Settings::new().expect("Error reading configuration");
    settings
        .monitoring
        .init()
        .expect("Error initializing monitoring");

    let mut mqtt_client = settings.mqtt.new_client();

    let entries = EntryManager::new();
    let entity_events = EventBus::new(256);

    let state_log = StateLog::new(entity_events.subscribe(), entries.subscribe());

    if let Some(thermostat) = settings.thermostat.clone() {
        let entry = ConfigEntry {
            id: "thermostat".to_string(),
            title: "Heater".to_string(),
        };
        let events = entity_events.emitter();
        let manager = entries.clone();
        entries.setup_in_background(entry, move |entry| {
            let thermostat = thermostat.clone();
            let events = events.clone();
            let manager = manager.clone();
            async move { thermostat.setup(entry, events, manager).await }
        });
    }

    if let Some(zigbee) = settings.zigbee.clone() {
        let subscription = mqtt_client
            .subscribe(zigbee.event_topic.clone())
            .await
            .expect("Error subscribing to MQTT topic");
        let transport = Arc::new(MqttDeviceTransport::new(subscription));

        let entry = ConfigEntry {
            id: "zigbee".to_string(),
            title: "Zigbee devices".to_string(),
        };
        let events = entity_events.emitter();
        let manager = entries.clone();
        entries.setup_in_background(entry, move |entry| {
            let zigbee = zigbee.clone();
            let transport = transport.clone();
            let events = events.clone();
            let manager = manager.clone();
            async move { zigbee.setup(entry, transport, events, manager).await }
        });
    }

    if let Some(quake_feed) = settings.quake_feed.clone() {
        let entry = ConfigEntry {
            id: "quake_feed".to_string(),
            title: "Earthquakes".to_string(),
        };
        let events = entity_events.emitter();
        entries.setup_in_background(entry, move |entry| {
            let quake_feed = quake_feed.clone();
            let events = events.clone();
            async move { quake_feed.setup(entry, events).await }
        });
    }

    tracing::info!("Starting main loop");

    tokio::select!(
        _ = mqtt_client.run() => {},
        _ = state_log.run() => {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        },
    );

    entries.unload_all().await;
}
