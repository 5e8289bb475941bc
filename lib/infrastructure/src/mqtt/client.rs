use rumqttc::v5::{
    mqttbytes::{
        v5::{ConnectProperties, Packet, Publish, SubscribeProperties},
        QoS,
    },
    AsyncClient, Event, EventLoop, MqttOptions,
};
use tokio::sync::mpsc;

use super::{MqttInMessage, MqttSubscription};

pub struct Mqtt {
    client: AsyncClient,
    event_loop: EventLoop,
    routes: Vec<TopicRoute>,
}

struct TopicRoute {
    topic: String,
    txs: Vec<mpsc::Sender<MqttInMessage>>,
}

impl Mqtt {
    pub fn connect(host: &str, port: u16, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(5));
        options.set_clean_start(false);

        let mut connect_props = ConnectProperties::new();
        connect_props.session_expiry_interval = 60.into();
        connect_props.max_packet_size = Some(1024 * 1024);
        options.set_connect_properties(connect_props);

        let (client, event_loop) = AsyncClient::new(options, 10);

        Self {
            client,
            event_loop,
            routes: vec![],
        }
    }

    pub async fn subscribe(&mut self, topic: impl Into<String>) -> anyhow::Result<MqttSubscription> {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel::<MqttInMessage>(32);

        if let Some(route) = self.routes.iter_mut().find(|r| r.topic == topic) {
            tracing::info!("Attaching additional receiver to MQTT topic {}", topic);
            route.txs.push(tx);
            return Ok(MqttSubscription::new(rx));
        }

        tracing::info!("Subscribing to MQTT topic {}", topic);

        self.routes.push(TopicRoute {
            topic: topic.clone(),
            txs: vec![tx],
        });

        self.client
            .subscribe_with_properties(
                &topic,
                QoS::AtLeastOnce,
                SubscribeProperties {
                    id: Some(self.routes.len()), //subscription ids start at 1
                    user_properties: vec![],
                },
            )
            .await?;

        Ok(MqttSubscription::new(rx))
    }

    /// Drives the connection and forwards publishes to their subscribers.
    /// Runs until the process ends; connection errors are retried.
    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => self.dispatch(publish).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("MQTT connection error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn dispatch(&self, publish: Publish) {
        let message: MqttInMessage = match (&publish).try_into() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Error decoding MQTT message: {}", e);
                return;
            }
        };

        tracing::trace!("Received MQTT message on topic {}", message.topic);

        let ids = publish
            .properties
            .map(|p| p.subscription_identifiers)
            .unwrap_or_default();

        if ids.is_empty() {
            tracing::warn!("MQTT message on {} carries no subscription id", message.topic);
            return;
        }

        for id in ids {
            let Some(route) = self.routes.get(id - 1) else {
                tracing::error!("No route for MQTT subscription id {}", id);
                continue;
            };

            for tx in route.txs.iter() {
                if let Err(e) = tx
                    .send_timeout(message.clone(), std::time::Duration::from_secs(5))
                    .await
                {
                    tracing::error!("Error forwarding MQTT message for {}: {}", route.topic, e);
                }
            }
        }
    }
}
