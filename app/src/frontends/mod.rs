use infrastructure::EventListener;

use crate::entity::EntityStateEvent;
use crate::registry::PlatformEvent;

/// Logs entity and platform activity; the stand-in for a UI or state
/// store.
pub struct StateLog {
    entity_events: EventListener<EntityStateEvent>,
    platform_events: EventListener<PlatformEvent>,
}

impl StateLog {
    pub fn new(
        entity_events: EventListener<EntityStateEvent>,
        platform_events: EventListener<PlatformEvent>,
    ) -> Self {
        Self {
            entity_events,
            platform_events,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.entity_events.recv() => match event {
                    Some(event) => log_entity_state(event),
                    None => break,
                },
                event = self.platform_events.recv() => match event {
                    Some(event) => log_platform_event(event),
                    None => break,
                },
            }
        }
    }
}

fn log_entity_state(event: EntityStateEvent) {
    if event.available {
        tracing::info!(
            "{} = {}",
            event.entity_id,
            event.state.as_deref().unwrap_or("unknown")
        );
    } else {
        tracing::info!(
            "{} is unavailable (last known: {})",
            event.entity_id,
            event.state.as_deref().unwrap_or("none")
        );
    }
}

fn log_platform_event(event: PlatformEvent) {
    match event {
        PlatformEvent::ReauthRequired { entry_id } => {
            tracing::warn!("Entry {} needs the user to reauthenticate", entry_id);
        }
        PlatformEvent::EntrySetupRetry {
            entry_id,
            attempts,
            next_delay,
        } => {
            tracing::info!(
                "Entry {} not ready yet (attempt {}), next try in {}",
                entry_id,
                attempts,
                next_delay
            );
        }
        PlatformEvent::EntryLoaded { entry_id } => {
            tracing::info!("Entry {} is up", entry_id);
        }
        PlatformEvent::EntryUnloaded { entry_id } => {
            tracing::info!("Entry {} is gone", entry_id);
        }
    }
}
