mod bus;
mod http;
mod monitoring;
mod mqtt;

pub use monitoring::MonitoringConfig;

pub use bus::{EventBus, EventEmitter, EventListener};
pub use http::HttpClientConfig;
pub use mqtt::{Mqtt, MqttConfig, MqttInMessage, MqttSubscription};
