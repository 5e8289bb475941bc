use std::sync::Arc;

use coordinator::{DataSource, ListenerHandle, UpdateCoordinator};
use infrastructure::EventEmitter;
use support::time::DateTime;

/// State change of one entity, published for the frontends.
#[derive(Debug, Clone)]
pub struct EntityStateEvent {
    pub entity_id: String,
    pub state: Option<String>,
    pub available: bool,
    pub updated_at: DateTime,
}

/// An entity fed by a coordinator: extracts one value from the snapshot
/// and republishes it after every refresh round.
///
/// `available` mirrors the coordinator's last refresh outcome. A stale
/// value keeps being rendered while the source is down, but never without
/// the availability flag dropping.
pub struct CoordinatedSensor<S: DataSource> {
    inner: Arc<SensorInner<S>>,
    _listener: ListenerHandle,
}

struct SensorInner<S: DataSource> {
    entity_id: String,
    coordinator: Arc<UpdateCoordinator<S>>,
    extract: Box<dyn Fn(&S::Data) -> Option<String> + Send + Sync>,
}

impl<S: DataSource> CoordinatedSensor<S> {
    /// Creates the sensor, subscribes it to its coordinator and publishes
    /// the state known right now (usually from the setup refresh).
    pub fn new(
        entity_id: impl Into<String>,
        coordinator: Arc<UpdateCoordinator<S>>,
        events: EventEmitter<EntityStateEvent>,
        extract: impl Fn(&S::Data) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(SensorInner {
            entity_id: entity_id.into(),
            coordinator: coordinator.clone(),
            extract: Box::new(extract),
        });

        events.send(inner.current_state());

        let subscriber = inner.clone();
        let listener = coordinator.add_listener(move || {
            events.send(subscriber.current_state());
            Ok(())
        });

        Self {
            inner,
            _listener: listener,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.inner.entity_id
    }

    pub fn state(&self) -> Option<String> {
        self.inner
            .coordinator
            .data()
            .and_then(|data| (self.inner.extract)(&data))
    }

    pub fn available(&self) -> bool {
        self.inner.coordinator.last_update_success()
    }
}

impl<S: DataSource> SensorInner<S> {
    fn current_state(&self) -> EntityStateEvent {
        EntityStateEvent {
            entity_id: self.entity_id.clone(),
            state: self
                .coordinator
                .data()
                .and_then(|data| (self.extract)(&data)),
            available: self.coordinator.last_update_success(),
            updated_at: DateTime::now(),
        }
    }
}
